//! The ECH dialer: staggered, bounded-concurrency connection racing with
//! ECH-reject retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ech_dns::{HostPort, Resolver, Target};
use thiserror::Error;
use tokio::task::JoinSet;

const DEFAULT_MAX_CONCURRENCY: usize = 3;
const DEFAULT_CONCURRENCY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from dialing.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("resolve: {0}")]
    Resolve(#[from] ech_dns::DnsError),

    /// Resolution produced no targets at all.
    #[error("no address")]
    NoAddress,

    /// `require_ech` is set but neither DNS nor the configuration supplied
    /// a config list.
    #[error("unable to get ECH config list")]
    NoEchConfigList,

    /// The server rejected the offered ECH config list. When it supplied
    /// retry configs, the dialer retries the same target once with them.
    #[error("ech rejected by server")]
    EchRejected { retry_config_list: Option<Vec<u8>> },

    #[error("timeout")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("other: {0}")]
    Other(String),

    /// Every target failed; the individual errors in attempt order.
    #[error("all connection attempts failed: {0:?}")]
    All(Vec<DialError>),
}

/// The TLS client parameters an [`EchDialer`] receives per attempt. The
/// dialer fills `ech_config_list` from DNS (or from the synthesized
/// public-name config) before each attempt.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    pub server_name: String,
    pub alpn: Vec<String>,
    pub ech_config_list: Option<Vec<u8>>,
}

/// Connects one target. Implementations wrap a TLS or QUIC stack; dropping
/// the returned connection must close it, since losing racers are dropped.
#[async_trait]
pub trait EchDialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn dial(
        &self,
        network: &str,
        target: &Target,
        tls: ClientTlsConfig,
    ) -> Result<Self::Conn, DialError>;
}

/// Dials destinations with Encrypted Client Hello, retrieving the config
/// list from DNS HTTPS records or from the server itself.
pub struct Dialer<D: EchDialer> {
    dial_fn: Arc<D>,
    pub resolver: Arc<Resolver>,
    /// Fail unless ECH is available for the attempt.
    pub require_ech: bool,
    /// When no config list is known, synthesize a fresh config for this
    /// name; the server will reject it and answer with its real configs in
    /// retry_config_list.
    pub public_name: Option<String>,
    pub max_concurrency: usize,
    pub concurrency_delay: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl<D: EchDialer> Dialer<D> {
    pub fn new(dial_fn: D) -> Self {
        Self {
            dial_fn: Arc::new(dial_fn),
            resolver: ech_dns::default_resolver(),
            require_ech: false,
            public_name: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            concurrency_delay: DEFAULT_CONCURRENCY_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The dial function this dialer connects with.
    pub fn dial_fn(&self) -> &D {
        &self.dial_fn
    }

    /// Connects to `addr` (a hostname, `host:port`, or URI; a
    /// comma-separated list is resolved element-wise and the targets
    /// interleaved). The first successful attempt wins; its peers are
    /// cancelled and their connections dropped.
    pub async fn dial(
        &self,
        network: &str,
        addr: &str,
        tls: ClientTlsConfig,
    ) -> Result<D::Conn, DialError> {
        let mut tls = tls;
        let mut lists: Vec<Vec<Target>> = Vec::new();
        for part in addr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if tls.server_name.is_empty() {
                tls.server_name = HostPort::parse(part)?.host;
            }
            let result = self.resolver.resolve(part).await?;
            lists.push(result.targets(network).collect());
        }
        let targets = interleave(lists);

        let need_ech = tls.ech_config_list.is_none();
        if need_ech {
            if let Some(public_name) = &self.public_name {
                let id = rand::random::<u8>();
                let (_, config) = ech_tls::new_config(id, public_name)
                    .map_err(|e| DialError::Other(format!("synthesize ech config: {e}")))?;
                let list = ech_tls::config_list(&[config])
                    .map_err(|e| DialError::Other(format!("synthesize ech config: {e}")))?;
                tls.ech_config_list = Some(list);
            }
        }

        let max_concurrency = if self.max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            self.max_concurrency
        };

        let mut pending = targets.into_iter().peekable();
        let mut join: JoinSet<Result<D::Conn, DialError>> = JoinSet::new();
        let mut errs: Vec<DialError> = Vec::new();

        let spawn_next = |join: &mut JoinSet<Result<D::Conn, DialError>>,
                          pending: &mut std::iter::Peekable<std::vec::IntoIter<Target>>| {
            if let Some(target) = pending.next() {
                let dial_fn = self.dial_fn.clone();
                let network = network.to_string();
                let tls = tls.clone();
                let timeout = self.timeout;
                let require_ech = self.require_ech;
                join.spawn(async move {
                    dial_one(dial_fn, &network, target, tls, timeout, require_ech, need_ech)
                        .await
                });
            }
        };

        spawn_next(&mut join, &mut pending);
        loop {
            if join.is_empty() {
                if pending.peek().is_none() {
                    return Err(if errs.is_empty() {
                        DialError::NoAddress
                    } else {
                        DialError::All(errs)
                    });
                }
                // Every in-flight attempt failed before the stagger fired.
                spawn_next(&mut join, &mut pending);
            }
            let can_spawn = pending.peek().is_some() && join.len() < max_concurrency;
            tokio::select! {
                joined = join.join_next() => match joined {
                    Some(Ok(Ok(conn))) => {
                        join.abort_all();
                        return Ok(conn);
                    }
                    Some(Ok(Err(err))) => {
                        tracing::debug!(target: "ech_transport::dialer", %err, "attempt failed");
                        errs.push(err);
                        // A failure frees a worker; don't wait out the
                        // stagger interval.
                        spawn_next(&mut join, &mut pending);
                    }
                    Some(Err(join_err)) => {
                        errs.push(DialError::Other(format!("worker: {join_err}")));
                        spawn_next(&mut join, &mut pending);
                    }
                    None => {}
                },
                _ = tokio::time::sleep(self.concurrency_delay), if can_spawn => {
                    spawn_next(&mut join, &mut pending);
                }
            }
        }
    }
}

async fn dial_one<D: EchDialer>(
    dial_fn: Arc<D>,
    network: &str,
    target: Target,
    mut tls: ClientTlsConfig,
    timeout: Duration,
    require_ech: bool,
    need_ech: bool,
) -> Result<D::Conn, DialError> {
    if need_ech {
        if let Some(ech) = &target.ech {
            tls.ech_config_list = Some(ech.clone());
        }
    }
    if require_ech && tls.ech_config_list.is_none() {
        return Err(DialError::NoEchConfigList);
    }
    tracing::debug!(
        target: "ech_transport::dialer",
        address = %target.address,
        ech = tls.ech_config_list.is_some(),
        "dialing"
    );
    match tokio::time::timeout(timeout, dial_fn.dial(network, &target, tls.clone())).await {
        Err(_) => Err(DialError::Timeout),
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(DialError::EchRejected {
            retry_config_list: Some(list),
        })) if !list.is_empty() => {
            tracing::debug!(
                target: "ech_transport::dialer",
                address = %target.address,
                "ech rejected, retrying with server config list"
            );
            tls.ech_config_list = Some(list);
            match tokio::time::timeout(timeout, dial_fn.dial(network, &target, tls)).await {
                Err(_) => Err(DialError::Timeout),
                Ok(result) => result,
            }
        }
        Ok(Err(err)) => Err(err),
    }
}

/// Round-robin interleaving of per-address target lists, so a slow or
/// unreachable first address does not monopolize the early attempts.
fn interleave(lists: Vec<Vec<Target>>) -> Vec<Target> {
    let mut out = Vec::with_capacity(lists.iter().map(Vec::len).sum());
    let mut iters: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();
    loop {
        let mut any = false;
        for iter in &mut iters {
            if let Some(target) = iter.next() {
                out.push(target);
                any = true;
            }
        }
        if !any {
            return out;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn target(addr: &str) -> Target {
        Target {
            address: addr.parse::<SocketAddr>().unwrap(),
            ech: None,
            alpn: Vec::new(),
        }
    }

    #[test]
    fn interleave_round_robins() {
        let a = vec![target("10.0.0.1:1"), target("10.0.0.2:1")];
        let b = vec![target("10.1.0.1:1"), target("10.1.0.2:1"), target("10.1.0.3:1")];
        let got: Vec<String> = interleave(vec![a, b])
            .into_iter()
            .map(|t| t.address.to_string())
            .collect();
        assert_eq!(
            got,
            vec![
                "10.0.0.1:1",
                "10.1.0.1:1",
                "10.0.0.2:1",
                "10.1.0.2:1",
                "10.1.0.3:1"
            ]
        );
    }

    #[test]
    fn interleave_single_list_is_identity() {
        let a = vec![target("10.0.0.1:1"), target("10.0.0.2:1")];
        let got = interleave(vec![a.clone()]);
        assert_eq!(got, a);
    }
}

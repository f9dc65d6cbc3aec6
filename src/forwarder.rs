use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::config::Rule;
use crate::error::ForwardError;
use crate::relay::pipe;

/// Without an explicit bound an unreachable host can hold a dial for minutes.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub dial_timeout: Duration,
    /// Log a line for every opened and closed connection.
    pub verbose: bool,
    /// Fixed seed for upstream selection. Seeded from the OS when unset.
    pub seed: Option<u64>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            verbose: true,
            seed: None,
        }
    }
}

/// Picks one upstream uniformly at random. `to` must not be empty.
pub fn pick_upstream<'a, R: Rng>(rng: &mut R, to: &'a [String]) -> &'a str {
    &to[rng.random_range(0..to.len())]
}

/// Opens a TCP connection to `addr`, giving up after `dial_timeout`.
pub async fn dial(addr: &str, dial_timeout: Duration) -> Result<TcpStream, ForwardError> {
    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ForwardError::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ForwardError::DialTimeout {
            addr: addr.to_string(),
            timeout: dial_timeout,
        }),
    }
}

/// Accept loop for a single rule.
///
/// Owns the rule's listener and its random source. Each accepted client is
/// handed to its own task, so a slow upstream never holds up the next accept.
pub struct RuleForwarder {
    rule: Arc<Rule>,
    listener: TcpListener,
    options: ForwardOptions,
    rng: StdRng,
    limiter: Option<Arc<Semaphore>>,
}

impl RuleForwarder {
    pub async fn bind(rule: Rule, options: ForwardOptions) -> Result<Self, ForwardError> {
        if rule.to.is_empty() {
            return Err(ForwardError::NoUpstreams { rule: rule.name });
        }

        let listener = TcpListener::bind(&rule.from)
            .await
            .map_err(|source| ForwardError::Bind {
                addr: rule.from.clone(),
                source,
            })?;

        let rng = options
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        let limiter = rule
            .max_connections
            .map(|permits| Arc::new(Semaphore::new(permits)));

        info!(
            rule = %rule.name,
            listen_addr = %listener.local_addr().map_or_else(|_| rule.from.clone(), |a| a.to_string()),
            upstreams = rule.to.len(),
            "Listening"
        );

        Ok(Self {
            rule: Arc::new(rule),
            listener,
            options,
            rng,
            limiter,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[must_use]
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Accepts connections until the listener fails or `shutdown` fires.
    ///
    /// On shutdown every open relay for this rule is torn down and drained
    /// before returning `Ok(())`. An accept failure is returned immediately;
    /// connections already relayed are left to finish on their own.
    pub async fn serve(mut self, shutdown: CancellationToken) -> Result<(), ForwardError> {
        let tracker = TaskTracker::new();

        let result = loop {
            let (client, client_addr) = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(source) => break Err(ForwardError::Accept {
                        addr: self.rule.from.clone(),
                        source,
                    }),
                },
            };

            let permit = match &self.limiter {
                Some(limiter) => {
                    if let Ok(permit) = Arc::clone(limiter).try_acquire_owned() {
                        Some(permit)
                    } else {
                        warn!(
                            rule = %self.rule.name,
                            client = %client_addr,
                            "Connection rejected: max connections reached"
                        );
                        continue;
                    }
                }
                None => None,
            };

            let upstream = pick_upstream(&mut self.rng, &self.rule.to).to_string();
            let rule = Arc::clone(&self.rule);
            let options = self.options.clone();
            let shutdown = shutdown.clone();

            tracker.spawn(async move {
                relay_connection(&rule, client, client_addr, &upstream, &options, &shutdown).await;
                drop(permit);
            });
        };

        tracker.close();
        match result {
            Ok(()) => {
                debug!(
                    rule = %self.rule.name,
                    in_flight = tracker.len(),
                    "Draining connections"
                );
                tracker.wait().await;
                info!(rule = %self.rule.name, "Forwarder stopped");
                Ok(())
            }
            Err(e) => {
                error!(rule = %self.rule.name, error = %e, "Accept loop failed");
                Err(e)
            }
        }
    }
}

/// Dials the chosen upstream and relays the pair until either side closes.
/// A failed dial drops the client; there is no retry against another upstream.
async fn relay_connection(
    rule: &Rule,
    client: TcpStream,
    client_addr: SocketAddr,
    upstream_addr: &str,
    options: &ForwardOptions,
    shutdown: &CancellationToken,
) {
    let upstream = match dial(upstream_addr, options.dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                rule = %rule.name,
                client = %client_addr,
                upstream = %upstream_addr,
                error = %e,
                "Dropping connection"
            );
            return;
        }
    };

    let upstream_peer = upstream
        .peer_addr()
        .map_or_else(|_| upstream_addr.to_string(), |addr| addr.to_string());

    if options.verbose {
        info!(
            rule = %rule.name,
            from = %rule.from,
            upstream = %upstream_peer,
            client = %client_addr,
            "Connected"
        );
    }

    let (stats, result) = pipe(client, upstream, shutdown).await;
    if let Err(e) = result {
        if options.verbose {
            warn!(rule = %rule.name, client = %client_addr, error = %e, "Error forwarding connection");
        } else {
            debug!(rule = %rule.name, client = %client_addr, error = %e, "Error forwarding connection");
        }
    }

    if options.verbose {
        info!(
            rule = %rule.name,
            from = %rule.from,
            upstream = %upstream_peer,
            client = %client_addr,
            bytes_sent = stats.client_to_upstream,
            bytes_received = stats.upstream_to_client,
            "Closed"
        );
    }
}

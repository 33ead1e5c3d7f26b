//! Connection fan-out: dial every host of a network concurrently

use crate::endpoints::{Endpoint, LocalEndpoint, RemoteEndpoint, SshOptions};
use crate::error::Result;
use crate::models::{FailurePolicy, Network, LOCALHOST};
use crate::output::{color_for, Console};
use crate::report::ClientError;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Endpoints that connected, in network order, plus the hosts that did not
pub struct Fleet {
    pub endpoints: Vec<Arc<dyn Endpoint>>,
    pub bastion: Option<Arc<RemoteEndpoint>>,
    pub errors: Vec<ClientError>,
}

impl Fleet {
    /// Close every endpoint, then the bastion they tunnel through
    pub async fn close(&self) {
        join_all(self.endpoints.iter().map(|e| e.close())).await;
        if let Some(bastion) = &self.bastion {
            bastion.close().await;
        }
    }
}

async fn connect_host(
    host: &str,
    index: usize,
    network: &Network,
    env: &str,
    ssh: &SshOptions,
    bastion: Option<&Arc<RemoteEndpoint>>,
) -> Result<Arc<dyn Endpoint>> {
    let color = Some(color_for(index));
    let user = network.user.as_deref();

    if host == LOCALHOST {
        return Ok(Arc::new(LocalEndpoint::connect(env, color)?));
    }

    let endpoint = match bastion {
        Some(bastion) => {
            RemoteEndpoint::connect_through(host, user, env, color, ssh, bastion).await?
        }
        None => RemoteEndpoint::connect(host, user, env, color, ssh).await?,
    };
    Ok(Arc::new(endpoint))
}

/// Connect to every host of `network`.
///
/// The bastion, if any, is dialed first and its failure is always fatal.
/// Host failures abort under fail-fast once every attempt has reported;
/// under the tolerant policy they are returned in [`Fleet::errors`].
pub async fn connect_network(
    network: &Network,
    env: &str,
    policy: FailurePolicy,
    ssh: &SshOptions,
    console: &Console,
) -> Result<Fleet> {
    let bastion = match network.bastion() {
        Some(host) => {
            info!("Connecting to bastion {}", host);
            let bastion =
                RemoteEndpoint::connect_bastion(host, network.user.as_deref(), ssh).await?;
            Some(Arc::new(bastion))
        }
        None => None,
    };

    info!("Connecting to {} hosts", network.hosts.len());
    let attempts = network.hosts.iter().enumerate().map(|(index, host)| {
        let bastion = bastion.as_ref();
        async move {
            let result = connect_host(host, index, network, env, ssh, bastion).await;
            (host, result)
        }
    });
    let results = join_all(attempts).await;

    let mut fleet = Fleet {
        endpoints: Vec::with_capacity(results.len()),
        bastion,
        errors: Vec::new(),
    };
    let mut fatal = None;

    for (host, result) in results {
        match result {
            Ok(endpoint) => {
                debug!("Connected to {}", host);
                fleet.endpoints.push(endpoint);
            }
            Err(e) if policy.is_tolerant() => {
                warn!("Skipping {}: {}", host, e);
                console.error_line("", &e);
                fleet.errors.push(ClientError::conn(host.as_str(), e));
            }
            Err(e) => {
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
    }

    if let Some(e) = fatal {
        fleet.close().await;
        return Err(e);
    }

    Ok(fleet)
}

// Coral is an open source distributed map-reduce engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Client side of a job: submission through the request handler and a tiny
//! callback daemon the master delivers the outcome to.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use anyhow::anyhow;
use tokio::sync::oneshot;

use crate::config::{ClientConfig, NetConfig, CLIENT_NAME, RQ_HANDLER_NAME};
use crate::daemon::{LookupName, RemoteDaemon, Startup};
use crate::distributed::member::Endpoint;
use crate::distributed::retry_strategy::ConstantBackoff;
use crate::distributed::sonic::{self, service::Message};
use crate::naming::broadcast;

use super::{FnRef, JobOutcome};

/// Serves exactly one `NotifyResults` call.
pub struct ClientService {
    outcome: Mutex<Option<oneshot::Sender<JobOutcome>>>,
}

sonic::service::sonic_service!(ClientService, [NotifyResults]);

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct NotifyResults {
    pub outcome: JobOutcome,
}

impl Message<ClientService> for NotifyResults {
    type Response = ();

    async fn handle(self, server: &ClientService) -> Self::Response {
        tracing::info!("received job outcome");

        if let Some(tx) = server
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tx.send(self.outcome).ok();
        }
    }
}

/// Used by the master to deliver the outcome to the endpoint the client
/// supplied at submission.
pub async fn notify(addr: SocketAddr, net: NetConfig, outcome: JobOutcome) -> crate::Result<()> {
    let request = NotifyResults { outcome };
    let mut backoff = ConstantBackoff::new(net.request_timeout, net.request_retries);

    loop {
        let attempt = async {
            let conn = sonic::service::Connection::<ClientService>::create_with_timeout(
                addr,
                net.request_timeout,
            )
            .await?;
            conn.send_with_timeout(&request, net.request_timeout).await
        };

        match attempt.await {
            Ok(()) => return Ok(()),
            Err(err) => match backoff.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(err.into()),
            },
        }
    }
}

/// A submitted job whose results have not arrived yet.
pub struct Submission {
    rx: oneshot::Receiver<JobOutcome>,
}

impl Submission {
    /// Blocks until the master calls back with the outcome.
    pub async fn await_results(self) -> crate::Result<JobOutcome> {
        Ok(self.rx.await?)
    }
}

/// Submits a job: binds the callback daemon, discovers the naming leader,
/// resolves the request handler and stages the job through it.
pub async fn submit(
    config: &ClientConfig,
    data: Vec<String>,
    map_fn: FnRef,
    reduce_fn: FnRef,
) -> crate::Result<Submission> {
    let net = config.net();

    let (tx, rx) = oneshot::channel();
    let service = ClientService {
        outcome: Mutex::new(Some(tx)),
    };
    let server = service.bind((config.host, 0)).await?;
    let callback_addr = server.local_addr()?;
    tokio::spawn(async move {
        loop {
            if server.accept().await.is_err() {
                break;
            }
        }
    });

    let broadcast_to = (config.broadcast_port != 0).then(|| {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), config.broadcast_port)
    });
    let discovery_window = net.request_timeout * net.request_retries;
    let leader = broadcast::discover(&config.seed_addrs, broadcast_to, None, discovery_window)
        .await
        .ok_or_else(|| anyhow!("no naming daemon answered discovery"))?;
    tracing::debug!(%leader, "discovered naming leader");

    let handler = RemoteDaemon::new(leader.addr, net)
        .send(&LookupName {
            name: RQ_HANDLER_NAME.to_string(),
        })
        .await?
        .ok_or_else(|| anyhow!("no request handler is registered"))?;

    let accepted = RemoteDaemon::new(handler.addr, net)
        .send(&Startup {
            client: Endpoint::new(CLIENT_NAME, callback_addr),
            data,
            map: map_fn,
            reduce: reduce_fn,
        })
        .await??;

    if !accepted {
        return Err(anyhow!("request handler refused the job"));
    }

    tracing::info!(%handler, "job submitted");
    Ok(Submission { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn notify_reaches_the_callback_daemon() {
        let (tx, rx) = oneshot::channel();
        let service = ClientService {
            outcome: Mutex::new(Some(tx)),
        };
        let server = service.bind(("127.0.0.1", 0)).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if server.accept().await.is_err() {
                    break;
                }
            }
        });

        let net = NetConfig {
            request_timeout: Duration::from_secs(1),
            request_retries: 2,
        };
        let outcome = JobOutcome::Completed(vec![("hello".to_string(), vec![1, 2])]);
        notify(addr, net, outcome.clone()).await.unwrap();

        let submission = Submission { rx };
        assert_eq!(submission.await_results().await.unwrap(), outcome);
    }
}

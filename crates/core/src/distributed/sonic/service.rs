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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::ToSocketAddrs;

use super::Result;

/// A service is a struct whose request/response envelope is derived with
/// [`sonic_service!`]. Each request type implements [`Message`] with its own
/// response type; the macro generates the envelope enums and the client-side
/// [`Wrapper`] impls.
pub trait Service: Sized + Send + Sync + 'static {
    type Request: bincode::Decode + Send + Sync;
    type RequestRef<'a>: bincode::Encode + Send + Sync;
    type Response: bincode::Encode + bincode::Decode + Send + Sync;

    fn handle(
        req: Self::Request,
        server: &Self,
    ) -> impl std::future::Future<Output = Self::Response> + Send + '_;
}

pub trait Message<S: Service> {
    type Response;
    fn handle(self, server: &S) -> impl std::future::Future<Output = Self::Response> + Send;
}

pub trait Wrapper<S: Service>: Message<S> {
    fn wrap_request_ref(req: &Self) -> S::RequestRef<'_>;
    fn unwrap_response(res: S::Response) -> Option<Self::Response>;
}

pub struct Server<S: Service> {
    inner: super::Server<S::Request, S::Response>,
    service: Arc<S>,
}

impl<S: Service> Server<S> {
    pub async fn bind(service: S, addr: impl ToSocketAddrs) -> Result<Self> {
        Ok(Server {
            inner: super::Server::bind(addr).await?,
            service: Arc::new(service),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn service(&self) -> Arc<S> {
        Arc::clone(&self.service)
    }

    /// Accepts one connection and spawns a task that serves a single request
    /// on it. Handlers therefore never block one another beyond their own IO.
    pub async fn accept(&self) -> Result<()> {
        let mut conn = self.inner.accept().await?;

        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            let mut req = match conn.request().await {
                Ok(req) => req,
                Err(e) => {
                    tracing::debug!("failed to read request: {}", e);
                    return;
                }
            };

            let body = req.take_body();
            let res = S::handle(body, &service).await;

            if let Err(e) = req.respond(res).await {
                tracing::error!("failed to respond to request: {}", e);
            }
        });

        Ok(())
    }
}

pub struct Connection<'a, S: Service> {
    inner: super::Connection<S::RequestRef<'a>, S::Response>,
}

impl<'a, S: Service> Connection<'a, S> {
    pub async fn create(server: impl ToSocketAddrs) -> Result<Connection<'a, S>> {
        Ok(Connection {
            inner: super::Connection::create(server).await?,
        })
    }

    pub async fn create_with_timeout(
        server: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Connection<'a, S>> {
        Ok(Connection {
            inner: super::Connection::create_with_timeout(server, timeout).await?,
        })
    }

    pub async fn send<R: Wrapper<S>>(mut self, request: &'a R) -> Result<R::Response> {
        let res = self.inner.send(&R::wrap_request_ref(request)).await?;

        R::unwrap_response(res).ok_or(super::Error::BadRequest)
    }

    pub async fn send_with_timeout<R: Wrapper<S>>(
        mut self,
        request: &'a R,
        timeout: Duration,
    ) -> Result<R::Response> {
        let res = self
            .inner
            .send_with_timeout(&R::wrap_request_ref(request), timeout)
            .await?;

        R::unwrap_response(res).ok_or(super::Error::BadRequest)
    }
}

macro_rules! sonic_service {
    ($service:ident, [$($req:ident),*$(,)?]) => {
        mod service_impl__ {
            #![allow(dead_code)]

            use super::{$service, $($req),*};

            use $crate::distributed::sonic;

            #[derive(Debug, Clone, ::bincode::Decode)]
            pub enum Request {
                $($req(Box<$req>),)*
            }
            #[derive(Debug, Clone, ::bincode::Encode)]
            pub enum RequestRef<'a> {
                $($req(&'a $req),)*
            }
            #[derive(::bincode::Encode, ::bincode::Decode)]
            pub enum Response {
                $($req(Box<<$req as sonic::service::Message<$service>>::Response>),)*
            }
            $(
                impl sonic::service::Wrapper<$service> for $req {
                    fn wrap_request_ref(req: &Self) -> RequestRef {
                        RequestRef::$req(req)
                    }
                    fn unwrap_response(res: <$service as sonic::service::Service>::Response) -> Option<Self::Response> {
                        #[allow(irrefutable_let_patterns)]
                        if let Response::$req(value) = res {
                            Some(*value)
                        } else {
                            None
                        }
                    }
                }
            )*
            impl sonic::service::Service for $service {
                type Request = Request;
                type RequestRef<'a> = RequestRef<'a>;
                type Response = Response;

                // NOTE: This is a workaround for the fact that async functions
                // don't have a Send bound by default, and there's currently no
                // way of specifying that.
                #[allow(clippy::manual_async_fn)]
                fn handle(req: Request, server: &Self) -> impl std::future::Future<Output = Self::Response> + Send + '_ {
                    async move {
                        match req {
                            $(
                                Request::$req(value) => Response::$req(Box::new(sonic::service::Message::handle(*value, server).await)),
                            )*
                        }
                    }
                }
            }
            impl $service {
                pub async fn bind(self, addr: impl ::tokio::net::ToSocketAddrs) -> sonic::Result<sonic::service::Server<Self>> {
                    sonic::service::Server::bind(self, addr).await
                }
            }
        }
    };
}

pub(crate) use sonic_service;

#[cfg(test)]
mod tests {
    use super::{Message, Server, Service, Wrapper};
    use std::{marker::PhantomData, net::SocketAddr, sync::atomic::AtomicI32};

    struct ConnectionBuilder<S> {
        addr: SocketAddr,
        marker: PhantomData<S>,
    }

    impl<S: Service> ConnectionBuilder<S> {
        async fn send<R: Wrapper<S>>(&self, req: &R) -> Result<R::Response, anyhow::Error> {
            Ok(super::Connection::create(self.addr)
                .await?
                .send(req)
                .await?)
        }
    }

    pub struct CounterService {
        pub counter: AtomicI32,
    }

    sonic_service!(CounterService, [Change, Reset]);

    #[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
    pub struct Change {
        pub amount: i32,
    }

    #[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
    pub struct Reset;

    impl Message<CounterService> for Change {
        type Response = i32;

        async fn handle(self, server: &CounterService) -> Self::Response {
            let prev = server
                .counter
                .fetch_add(self.amount, std::sync::atomic::Ordering::SeqCst);
            prev + self.amount
        }
    }

    impl Message<CounterService> for Reset {
        type Response = ();

        async fn handle(self, server: &CounterService) -> Self::Response {
            server.counter.store(0, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn simple_service() {
        let server = Server::bind(
            CounterService {
                counter: AtomicI32::new(0),
            },
            ("127.0.0.1", 0),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                server.accept().await.unwrap();
            }
        });

        let conn = ConnectionBuilder::<CounterService> {
            addr,
            marker: PhantomData,
        };

        let val = conn.send(&Change { amount: 15 }).await.unwrap();
        assert_eq!(val, 15);
        let val = conn.send(&Change { amount: 15 }).await.unwrap();
        assert_eq!(val, 30);
        conn.send(&Reset).await.unwrap();
        let val = conn.send(&Change { amount: 15 }).await.unwrap();
        assert_eq!(val, 15);
    }
}

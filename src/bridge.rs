// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::convert::Infallible;

use hyper::http::StatusCode;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::transport::UsbTransport;

#[derive(Debug)]
pub enum ShutdownReason {
    Error,
    Signal,
    Unplugged,
}

/// The loopback front end: accepts TCP clients and forwards every HTTP
/// request through the USB transport.
pub struct Bridge {
    num_clients: usize,
    shutdown: mpsc::Receiver<ShutdownReason>,
    listener: TcpListener,
    transport: UsbTransport,
}

impl Bridge {
    pub fn new(
        shutdown: mpsc::Receiver<ShutdownReason>,
        listener: TcpListener,
        transport: UsbTransport,
    ) -> Self {
        Self {
            num_clients: 0,
            shutdown,
            listener,
            transport,
        }
    }

    pub async fn run(&mut self) {
        'poll: loop {
            tokio::select! {
                shutdown_type = self.shutdown.recv() => {
                    info!(
                        "Shutdown event received: {:?}",
                        shutdown_type.unwrap_or(ShutdownReason::Error));
                    break 'poll;
                }

                c = self.listener.accept() => {
                    match c {
                        Ok((stream, addr)) => {
                            info!("Connection opened from {}", addr);
                            self.handle_connection(stream);
                        }
                        Err(err) => error!("Failed to accept connection: {}", err),
                    }
                }
            }
        }
    }

    async fn service_request(
        transport: UsbTransport,
        request: Request<Body>,
    ) -> std::result::Result<Response<Body>, Infallible> {
        match transport.round_trip(request).await {
            Ok(response) => Ok(response),
            Err(Error::Shutdown) => Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::empty())
                .unwrap()),
            Err(err) => {
                error!("Request failed: {}", err);
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
        }
    }

    fn handle_connection(&mut self, stream: TcpStream) {
        let transport = self.transport.clone();
        self.num_clients += 1;
        let client_num = self.num_clients;

        tokio::spawn(async move {
            debug!("Connection {} opened", client_num);
            if let Err(http_err) = http1::Builder::new()
                .title_case_headers(true)
                .preserve_header_case(true)
                .serve_connection(
                    stream,
                    service_fn(move |req| Bridge::service_request(transport.clone(), req)),
                )
                .await
            {
                error!("Error serving HTTP connection: {}", http_err);
            }
            debug!("Connection {} closed", client_num);
        });
    }
}

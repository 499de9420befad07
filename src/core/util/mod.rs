use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use http::{header::CONTENT_TYPE, Request, Response};

/// Content type of every Cloud Secure Area request and response body.
pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

/// Generic HTTP client.
///
/// A trait is used here so to facilitate native HTTP/TLS when compiled for mobile applications.
#[async_trait]
pub trait AsyncHttpClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

#[async_trait]
impl<T: AsyncHttpClient + Send + Sync + ?Sized> AsyncHttpClient for Arc<T> {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        self.as_ref().execute(request).await
    }
}

/// A binary POST request to `uri`.
pub(crate) fn post_request(uri: &str, body: Vec<u8>) -> Result<Request<Vec<u8>>> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, CBOR_CONTENT_TYPE)
        .body(body)
        .context("unable to construct request")
}

/// Production transport for [CloudSecureArea](crate::csa::CloudSecureArea):
/// talks to a remote server over HTTPS. Tests and the in-process reference
/// server use [CloudSecureAreaServer](crate::csa::CloudSecureAreaServer)
/// directly instead.
#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl AsRef<reqwest::Client> for ReqwestClient {
    fn as_ref(&self) -> &reqwest::Client {
        &self.0
    }
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("unable to build http_client")
            .map(Self)
    }
}

#[async_trait]
impl AsyncHttpClient for ReqwestClient {
    async fn execute(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let response = self
            .0
            .execute(request.try_into().context("unable to convert request")?)
            .await
            .context("http request failed")?;

        let mut builder = Response::builder()
            .status(response.status())
            .version(response.version());

        builder
            .headers_mut()
            .context("unable to set headers")?
            .extend(response.headers().clone());

        builder
            .body(
                response
                    .bytes()
                    .await
                    .context("failed to extract response body")?
                    .to_vec(),
            )
            .context("unable to construct response")
    }
}

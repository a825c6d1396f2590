//! HTTP capability the provider clients are written against

use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, error, trace};

pub type ByteStream
  = BoxStream<'static, Result<Bytes, crate::error::Error>>;

/// Outgoing JSON POST
#[derive(Clone)]
pub struct HttpRequest
{   pub url: String
  , pub headers: Vec<(String, String)>
  , pub body: serde_json::Value
  , pub timeout: Option<Duration>
}

// Header values carry credentials; only names are printed.
impl std::fmt::Debug for HttpRequest
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   let names: Vec<&str> = self.headers
          .iter()
          .map(|(name, _)| name.as_str())
          .collect();
        f.debug_struct("HttpRequest")
          .field("url", &self.url)
          .field("headers", &names)
          .field("timeout", &self.timeout)
          .finish()
    }
}

/// Fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse
{   pub status: u16
  , pub retry_after: Option<Duration>
  , pub body: String
}

impl HttpResponse
{   pub fn is_success(&self) -> bool
    {   (200..300).contains(&self.status)
    }
}

/// Response whose body arrives incrementally
pub struct HttpStreamResponse
{   pub status: u16
  , pub retry_after: Option<Duration>
  , pub body: ByteStream
}

impl HttpStreamResponse
{   pub fn is_success(&self) -> bool
    {   (200..300).contains(&self.status)
    }

    /// Drain the body into a string, for error statuses.
    pub async fn collect_body(self) -> String
    {   let mut body = Vec::new();
        let mut stream = self.body;
        while let Some(chunk) = stream.next().await
        {   match chunk
            {   Ok(bytes) => body.extend_from_slice(&bytes)
              , Err(_) => break
            }
        }
        String::from_utf8_lossy(&body).into_owned()
    }
}

/// Send a request, get a response or a stream of bytes.
#[async_trait]
pub trait HttpTransport: Send + Sync
{   async fn post_json(
      &self
    , request: HttpRequest
    ) -> Result<HttpResponse, crate::error::Error>;

    async fn post_stream(
      &self
    , request: HttpRequest
    ) -> Result<HttpStreamResponse, crate::error::Error>;
}

/// `reqwest` backed transport
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport
{   http_client: reqwest::Client
}

impl ReqwestTransport
{   pub fn new() -> Self
    {   debug!("Creating ReqwestTransport");
        ReqwestTransport
        {   http_client: reqwest::Client::new()
        }
    }

    pub fn with_client(http_client: reqwest::Client) -> Self
    {   ReqwestTransport { http_client }
    }

    fn build(
      &self
    , request: &HttpRequest
    , apply_timeout: bool
    ) -> reqwest::RequestBuilder
    {   let mut builder = self.http_client
          .post(&request.url)
          .json(&request.body);
        for (name, value) in &request.headers
        {   builder = builder.header(name.as_str(), value.as_str());
        }
        if apply_timeout
        {   if let Some(timeout) = request.timeout
            {   builder = builder.timeout(timeout);
            }
        }
        builder
    }
}

fn map_reqwest_error(
  e: reqwest::Error
, timeout: Option<Duration>
) -> crate::error::Error
{   if e.is_timeout()
    {   error!("HTTP timeout: {}", e);
        return crate::error::Error::Timeout(
          timeout.unwrap_or_default()
        );
    }
    error!("HTTP error: {}", e);
    crate::error::Error::Network(e.to_string())
}

fn retry_after_header(
  headers: &reqwest::header::HeaderMap
) -> Option<Duration>
{   headers
      .get(reqwest::header::RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.trim().parse::<f64>().ok())
      .filter(|secs| secs.is_finite() && *secs >= 0.0)
      .map(Duration::from_secs_f64)
}

#[async_trait]
impl HttpTransport for ReqwestTransport
{   async fn post_json(
      &self
    , request: HttpRequest
    ) -> Result<HttpResponse, crate::error::Error>
    {   trace!("POST {}", request.url);
        let response = self
          .build(&request, true)
          .send()
          .await
          .map_err(|e| map_reqwest_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let retry_after = retry_after_header(response.headers());
        trace!("Response status: {}", status);

        let body = response
          .text()
          .await
          .map_err(|e| map_reqwest_error(e, request.timeout))?;

        Ok(HttpResponse
        {   status
          , retry_after
          , body
        })
    }

    async fn post_stream(
      &self
    , request: HttpRequest
    ) -> Result<HttpStreamResponse, crate::error::Error>
    {   trace!("POST (stream) {}", request.url);
        // a whole-request timeout would cut long streams short
        let response = self
          .build(&request, false)
          .send()
          .await
          .map_err(|e| map_reqwest_error(e, None))?;

        let status = response.status().as_u16();
        let retry_after = retry_after_header(response.headers());
        trace!("Stream response status: {}", status);

        let body = response
          .bytes_stream()
          .map(|chunk| chunk.map_err(|e| map_reqwest_error(e, None)))
          .boxed();

        Ok(HttpStreamResponse
        {   status
          , retry_after
          , body
        })
    }
}

#[cfg(test)]
pub(crate) mod testing
{   //! Scripted transport for provider wire tests.

    use super::*;
    use parking_lot::Mutex;

    pub(crate) enum Script
    {   Json(HttpResponse)
      , Stream(u16, ByteStream)
      , Fail(crate::error::Error)
        // Response headers never arrive.
      , Stall
    }

    #[derive(Default)]
    pub(crate) struct ScriptedTransport
    {   pub(crate) requests: Mutex<Vec<HttpRequest>>
      , scripts: Mutex<Vec<Script>>
    }

    impl ScriptedTransport
    {   pub(crate) fn new() -> Self
        {   ScriptedTransport::default()
        }

        pub(crate) fn push(&self, script: Script)
        {   self.scripts.lock().push(script);
        }

        pub(crate) fn json(&self, status: u16, body: &str)
        {   self.push(Script::Json(HttpResponse
            {   status
              , retry_after: None
              , body: body.to_string()
            }));
        }

        pub(crate) fn sse(&self, status: u16, chunks: Vec<&str>)
        {   let owned: Vec<Result<Bytes, crate::error::Error>>
              = chunks
                .into_iter()
                .map(|c| Ok(Bytes::from(c.to_string())))
                .collect();
            self.push(Script::Stream(
              status,
              futures::stream::iter(owned).boxed()
            ));
        }

        pub(crate) fn last_request(&self) -> HttpRequest
        {   self.requests
              .lock()
              .last()
              .cloned()
              .expect("no request recorded")
        }

        fn next(&self) -> Script
        {   let mut scripts = self.scripts.lock();
            assert!(!scripts.is_empty(), "transport script exhausted");
            scripts.remove(0)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport
    {   async fn post_json(
          &self
        , request: HttpRequest
        ) -> Result<HttpResponse, crate::error::Error>
        {   self.requests.lock().push(request);
            match self.next()
            {   Script::Json(response) => Ok(response)
              , Script::Fail(e) => Err(e)
              , Script::Stream(..) => panic!("expected json script")
              , Script::Stall => std::future::pending().await
            }
        }

        async fn post_stream(
          &self
        , request: HttpRequest
        ) -> Result<HttpStreamResponse, crate::error::Error>
        {   self.requests.lock().push(request);
            match self.next()
            {   Script::Stream(status, body) => Ok(HttpStreamResponse
                {   status
                  , retry_after: None
                  , body
                })
              , Script::Json(response) => Ok(HttpStreamResponse
                {   status: response.status
                  , retry_after: response.retry_after
                  , body: futures::stream::iter(vec![
                      Ok(Bytes::from(response.body))
                    ]).boxed()
                })
              , Script::Fail(e) => Err(e)
              , Script::Stall => std::future::pending().await
            }
        }
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn debug_output_hides_header_values()
    {   let request = HttpRequest
        {   url: "https://example.invalid/v1".to_string()
          , headers: vec![
              ("Authorization".to_string(), "Bearer sk-secret".to_string())
            ]
          , body: serde_json::json!({})
          , timeout: None
        };
        let printed = format!("{:?}", request);
        assert!(printed.contains("Authorization"));
        assert!(!printed.contains("sk-secret"));
    }

    #[tokio::test]
    async fn collects_error_bodies()
    {   let response = HttpStreamResponse
        {   status: 500
          , retry_after: None
          , body: futures::stream::iter(vec![
              Ok(Bytes::from_static(b"{\"error\":")),
              Ok(Bytes::from_static(b"\"boom\"}")),
            ]).boxed()
        };
        assert!(!response.is_success());
        assert_eq!(response.collect_body().await, "{\"error\":\"boom\"}");
    }
}

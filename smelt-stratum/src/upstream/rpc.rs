//! Coin daemon JSON-RPC client.
//!
//! Only the one method this daemon ever calls: `submitblock`. The response
//! string is classified rather than parsed strictly, because daemons are not
//! deterministic about it: an empty result means the block was accepted,
//! `"inconclusive"` means accepted-tentative, and anything else is
//! informational.

use serde::Deserialize;
use serde_json::{json, Value};

use super::UpstreamError;

/// Classified `submitblock` outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Inconclusive,
    Other(String),
}

/// JSON-RPC client for one coin daemon endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl RpcClient {
    /// Client for `<endpoint>rpc`.
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{endpoint}rpc"),
        }
    }

    /// Submit a hex-encoded block with the conventional empty options param.
    pub async fn submit_block(&self, block_hex: &str) -> Result<SubmitResult, UpstreamError> {
        let request = json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": "submitblock",
            "params": [block_hex, []],
        });
        let response: JsonRpcResponse = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.error {
            return Err(UpstreamError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(classify(response.result.as_ref()))
    }
}

fn classify(result: Option<&Value>) -> SubmitResult {
    match result {
        None | Some(Value::Null) => SubmitResult::Accepted,
        Some(Value::String(s)) if s.is_empty() => SubmitResult::Accepted,
        Some(Value::String(s)) if s == "inconclusive" => SubmitResult::Inconclusive,
        Some(other) => SubmitResult::Other(
            other
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_accepted() {
        assert_eq!(classify(None), SubmitResult::Accepted);
        assert_eq!(classify(Some(&Value::Null)), SubmitResult::Accepted);
        assert_eq!(classify(Some(&json!(""))), SubmitResult::Accepted);
    }

    #[test]
    fn test_classify_inconclusive() {
        assert_eq!(
            classify(Some(&json!("inconclusive"))),
            SubmitResult::Inconclusive
        );
    }

    #[test]
    fn test_classify_other_is_informational() {
        assert_eq!(
            classify(Some(&json!("duplicate-invalid"))),
            SubmitResult::Other("duplicate-invalid".into())
        );
    }

    #[tokio::test]
    async fn test_submit_block_against_local_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();

            let body = r#"{"result":null,"error":null,"id":1}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });

        let client = RpcClient::new(&format!("http://{addr}/"));
        let result = client.submit_block("00ff").await.unwrap();
        assert_eq!(result, SubmitResult::Accepted);

        let request = server.await.unwrap();
        assert!(request.contains("submitblock"));
        assert!(request.contains("00ff"));
    }

    #[tokio::test]
    async fn test_rpc_error_is_an_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = r#"{"result":null,"error":{"code":-22,"message":"Block decode failed"},"id":1}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let client = RpcClient::new(&format!("http://{addr}/"));
        match client.submit_block("00").await {
            Err(UpstreamError::Rpc { code, message }) => {
                assert_eq!(code, -22);
                assert_eq!(message, "Block decode failed");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }
}

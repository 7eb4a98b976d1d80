//! Shared test helpers: a minimal HTTP stub server and counting activity
//! registries for the arithmetic sequence scenario.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use bizflow::ActivityRegistry;

/// Tiny canned-response HTTP server. Answers every request with the
/// configured status and body, counting hits.
pub struct HttpStub {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl HttpStub {
    pub async fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let body = body.to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                tokio::spawn(async move {
                    let _ = read_request(&mut stream).await;
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Self { addr, hits, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Stop accepting connections. Further requests get connection refused.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Read one request: headers, then a Content-Length body if present.
async fn read_request(stream: &mut tokio::net::TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
    };
    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut have = buf.len() - (header_end + 4);
    while have < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        have += n;
    }
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Numbers {
    pub number1: f64,
    pub number2: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub number1: f64,
    pub number2: f64,
    pub result: f64,
}

/// Per-operation invocation counters, for at-most-once assertions.
#[derive(Default)]
pub struct OpCounters {
    pub sum: AtomicUsize,
    pub difference: AtomicUsize,
    pub product: AtomicUsize,
    pub quotient: AtomicUsize,
}

impl OpCounters {
    pub fn total(&self) -> usize {
        self.sum.load(Ordering::SeqCst)
            + self.difference.load(Ordering::SeqCst)
            + self.product.load(Ordering::SeqCst)
            + self.quotient.load(Ordering::SeqCst)
    }
}

fn op_result(n: Numbers, result: f64) -> OperationResult {
    OperationResult {
        number1: n.number1,
        number2: n.number2,
        result,
    }
}

/// The four arithmetic activities, each bumping its counter on invocation.
pub fn arithmetic_registry(counters: Arc<OpCounters>) -> ActivityRegistry {
    let c1 = counters.clone();
    let c2 = counters.clone();
    let c3 = counters.clone();
    let c4 = counters;
    ActivityRegistry::builder()
        .register_typed("Sum", move |n: Numbers| {
            let c = c1.clone();
            async move {
                c.sum.fetch_add(1, Ordering::SeqCst);
                Ok(op_result(n.clone(), n.number1 + n.number2))
            }
        })
        .register_typed("Difference", move |n: Numbers| {
            let c = c2.clone();
            async move {
                c.difference.fetch_add(1, Ordering::SeqCst);
                Ok(op_result(n.clone(), n.number1 - n.number2))
            }
        })
        .register_typed("Product", move |n: Numbers| {
            let c = c3.clone();
            async move {
                c.product.fetch_add(1, Ordering::SeqCst);
                Ok(op_result(n.clone(), n.number1 * n.number2))
            }
        })
        .register_typed("Quotient", move |n: Numbers| {
            let c = c4.clone();
            async move {
                c.quotient.fetch_add(1, Ordering::SeqCst);
                Ok(op_result(n.clone(), n.number1 / n.number2))
            }
        })
        .build()
}

/// The sequence driver: Sum, Difference, Product, Quotient, each feeding on
/// the previous result. Mirrors a chained-arithmetic workflow program.
pub async fn run_sequence(
    wf: &bizflow::Orchestration,
    input: Numbers,
) -> Result<f64, bizflow::OrchestrationError> {
    wf.start_workflow("sequence").await?;
    let sum: OperationResult = wf.call_task("Sum", &input, "Operation2").await?;
    let diff: OperationResult = wf
        .call_task(
            "Difference",
            &Numbers {
                number1: sum.result,
                number2: input.number2,
            },
            "Operation3",
        )
        .await?;
    let prod: OperationResult = wf
        .call_task(
            "Product",
            &Numbers {
                number1: diff.result,
                number2: input.number2,
            },
            "Operation4",
        )
        .await?;
    let quot: OperationResult = wf
        .call_task(
            "Quotient",
            &Numbers {
                number1: prod.result,
                number2: input.number2,
            },
            "Operation5",
        )
        .await?;
    wf.complete_workflow(&quot.result).await?;
    Ok(quot.result)
}

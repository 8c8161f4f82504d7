#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use naviwatch::k8s::client::{ApiRequest, ApiResponse, RequestExecutor};
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Canned answer for one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Non-success status with an empty body
    Status(u16),
    /// Successful buffered JSON body
    Json(String),
    /// Successful streamed body. `end` closes the stream after the chunks,
    /// otherwise it stays open forever.
    Stream { chunks: Vec<String>, end: bool },
    /// The request never gets an answer
    Pending,
}

impl Reply {
    pub fn silent_stream() -> Self {
        Self::Stream {
            chunks: Vec::new(),
            end: false,
        }
    }

    pub fn open_stream(chunks: &[&str]) -> Self {
        Self::Stream {
            chunks: chunks.iter().map(ToString::to_string).collect(),
            end: false,
        }
    }

    fn into_response(self) -> ApiResponse {
        match self {
            Self::Status(status) => ApiResponse::buffered(status, "scripted failure", Bytes::new()),
            Self::Json(body) => ApiResponse::buffered(200, "OK", body),
            Self::Stream { chunks, end } => {
                let head = stream::iter(
                    chunks
                        .into_iter()
                        .map(|chunk| Ok::<_, naviwatch::Error>(Bytes::from(chunk))),
                );
                let body = if end {
                    head.boxed()
                } else {
                    head.chain(stream::pending()).boxed()
                };
                ApiResponse::new(200, "OK", body)
            }
            Self::Pending => unreachable!("pending replies are never turned into responses"),
        }
    }
}

/// Executor answering list and watch requests from two scripts. The last
/// reply of each script is repeated once the others are used up.
pub struct ScriptedExecutor {
    server: Url,
    lists: Mutex<VecDeque<Reply>>,
    watches: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Url>>,
}

impl ScriptedExecutor {
    pub fn new(lists: Vec<Reply>, watches: Vec<Reply>) -> Self {
        Self {
            server: Url::parse("https://k8s.test:6443").unwrap(),
            lists: Mutex::new(lists.into()),
            watches: Mutex::new(watches.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }

    pub fn watch_requests(&self) -> Vec<Url> {
        self.requests()
            .into_iter()
            .filter(is_watch)
            .collect()
    }

    fn next(script: &Mutex<VecDeque<Reply>>) -> Reply {
        let mut script = script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap_or(Reply::Status(404))
        }
    }
}

fn is_watch(url: &Url) -> bool {
    url.query_pairs().any(|(k, v)| k == "watch" && v == "true")
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    fn server_url(&self) -> &Url {
        &self.server
    }

    async fn execute(&self, request: ApiRequest) -> ApiResponse {
        self.requests.lock().unwrap().push(request.url.clone());
        let reply = if is_watch(&request.url) {
            Self::next(&self.watches)
        } else {
            Self::next(&self.lists)
        };
        if matches!(reply, Reply::Pending) {
            std::future::pending::<()>().await;
        }
        reply.into_response()
    }
}

pub fn config_map_json(name: &str, uid: &str, rv: &str) -> String {
    format!(
        r#"{{"apiVersion":"v1","kind":"ConfigMap","metadata":{{"name":"{name}","namespace":"default","uid":"{uid}","resourceVersion":"{rv}"}}}}"#
    )
}

pub fn list_json(rv: &str, items: &[String]) -> String {
    format!(
        r#"{{"apiVersion":"v1","kind":"ConfigMapList","metadata":{{"resourceVersion":"{rv}"}},"items":[{}]}}"#,
        items.join(",")
    )
}

/// One page of a paginated list. An empty `continue_token` marks the last page.
pub fn page_json(rv: &str, continue_token: &str, items: &[String]) -> String {
    format!(
        r#"{{"apiVersion":"v1","kind":"ConfigMapList","metadata":{{"resourceVersion":"{rv}","continue":"{continue_token}"}},"items":[{}]}}"#,
        items.join(",")
    )
}

pub fn event_line(change: &str, object: &str) -> String {
    format!("{{\"type\":\"{change}\",\"object\":{object}}}\n")
}

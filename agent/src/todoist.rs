//! Minimal Todoist REST v2 client: list open tasks, comment, close.

use common::config::TodoistConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TodoistError {
    #[error("no Todoist token; set {} or [todoist] token", common::config::TOKEN_ENV_VAR)]
    MissingToken,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, TodoistError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Serialize)]
struct NewComment<'a> {
    task_id: &'a str,
    content: &'a str,
}

pub struct TodoistClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    project_id: Option<String>,
    filter: Option<String>,
}

impl TodoistClient {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TodoistError::Client)?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            project_id: None,
            filter: None,
        })
    }

    pub fn from_config(config: &TodoistConfig) -> Result<Self> {
        let token = config.token().ok_or(TodoistError::MissingToken)?;
        let mut client = Self::new(
            &config.api_base,
            token,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        client.project_id = config.project_id.clone();
        client.filter = config.filter.clone();
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send(&self, url: String, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|source| TodoistError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TodoistError::Status {
            url,
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }

    /// Open tasks, optionally narrowed by project and filter.
    pub async fn active_tasks(&self) -> Result<Vec<Task>> {
        let url = self.url("/tasks");
        let mut query = Vec::new();
        if let Some(project_id) = &self.project_id {
            query.push(("project_id", project_id.as_str()));
        }
        if let Some(filter) = &self.filter {
            query.push(("filter", filter.as_str()));
        }

        let response = self
            .send(url.clone(), self.client.get(&url).query(&query))
            .await?;
        let tasks: Vec<Task> = response
            .json()
            .await
            .map_err(|source| TodoistError::Request { url, source })?;

        let active: Vec<Task> = tasks.into_iter().filter(|t| !t.is_completed).collect();
        log::info!("found {} active tasks", active.len());
        Ok(active)
    }

    pub async fn add_comment(&self, task_id: &str, content: &str) -> Result<()> {
        let url = self.url("/comments");
        let body = NewComment { task_id, content };
        self.send(url.clone(), self.client.post(&url).json(&body))
            .await?;
        Ok(())
    }

    pub async fn close_task(&self, task_id: &str) -> Result<()> {
        let url = self.url(&format!("/tasks/{}/close", task_id));
        self.send(url.clone(), self.client.post(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TodoistClient {
        TodoistClient::new(server.uri(), "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_active_tasks_skips_completed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "1", "content": "Send the weekly report", "is_completed": false},
                {"id": "2", "content": "Old", "is_completed": true},
                {"id": "3", "content": "Backup", "description": "nightly", "priority": 4}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let tasks = client(&server).active_tasks().await.unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["1", "3"]);
        assert_eq!(tasks[1].description, "nightly");
    }

    #[tokio::test]
    async fn test_project_filter_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks"))
            .and(query_param("project_id", "42"))
            .and(query_param("filter", "today"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let config = TodoistConfig {
            api_base: format!("{}/", server.uri()),
            token: Some("secret".into()),
            project_id: Some("42".into()),
            filter: Some("today".into()),
            ..TodoistConfig::default()
        };
        let tasks = TodoistClient::from_config(&config)
            .unwrap()
            .active_tasks()
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_comment_and_close() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/comments"))
            .and(body_json(json!({"task_id": "7", "content": "done"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tasks/7/close"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client.add_comment("7", "done").await.unwrap();
        client.close_task("7").await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/9/close"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden\n"))
            .mount(&server)
            .await;

        let err = client(&server).close_task("9").await.unwrap_err();
        match err {
            TodoistError::Status { status, body, url } => {
                assert_eq!(status, 403);
                assert_eq!(body, "Forbidden");
                assert!(url.ends_with("/tasks/9/close"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_token() {
        let config = TodoistConfig {
            token: Some(String::new()),
            ..TodoistConfig::default()
        };
        // An empty configured token still falls through to the env var.
        if std::env::var(common::config::TOKEN_ENV_VAR).is_err() {
            assert!(matches!(
                TodoistClient::from_config(&config),
                Err(TodoistError::MissingToken)
            ));
        }
    }
}

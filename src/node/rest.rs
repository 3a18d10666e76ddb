use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serenity::model::id::GuildId;
use std::time::Duration;
use tracing::debug;

use super::protocol::{ErrorResponse, LoadResult, UpdatePlayer, UpdateSession};
use crate::{config::NodeConfig, error::Error, Result};

/// API REST de un nodo. Sin estado: el session id lo aporta el llamador.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn update_session(&self, session_id: &str, update: &UpdateSession) -> Result<()>;

    async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<()>;

    async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> Result<()>;

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult>;
}

/// Cliente HTTP contra `/v4` de un nodo
pub struct RestClient {
    http: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(config: &NodeConfig, client_name: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&config.password)
                .map_err(|e| Error::Rest { status: 0, message: e.to_string() })?,
        );

        let http = Client::builder()
            .default_headers(headers)
            .user_agent(client_name)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            base_url: config.rest_url(),
        })
    }

    fn player_url(&self, session_id: &str, guild_id: GuildId) -> String {
        format!("{}/sessions/{}/players/{}", self.base_url, session_id, guild_id)
    }
}

/// Convierte respuestas no exitosas en `Error::Rest` con el mensaje del nodo
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => format!(
            "{} ({})",
            body.message.unwrap_or(body.error),
            body.path
        ),
        Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
    };

    Err(Error::Rest {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RestApi for RestClient {
    async fn update_session(&self, session_id: &str, update: &UpdateSession) -> Result<()> {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        check(self.http.patch(url).json(update).send().await?).await?;
        Ok(())
    }

    async fn update_player(
        &self,
        session_id: &str,
        guild_id: GuildId,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<()> {
        debug!("📤 PATCH player {}: {:?}", guild_id, update);
        check(
            self.http
                .patch(self.player_url(session_id, guild_id))
                .query(&[("noReplace", no_replace)])
                .json(update)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn destroy_player(&self, session_id: &str, guild_id: GuildId) -> Result<()> {
        check(
            self.http
                .delete(self.player_url(session_id, guild_id))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let url = format!("{}/loadtracks", self.base_url);
        let response = check(
            self.http
                .get(url)
                .query(&[("identifier", identifier)])
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        http::{HeaderMap, Method, StatusCode, Uri},
        response::IntoResponse,
        Json, Router,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    /// Petición vista por el nodo de prueba: método, URI, Authorization y cuerpo
    type Seen = Arc<Mutex<Vec<(Method, String, Option<String>, String)>>>;

    async fn lavalink(
        State(seen): State<Seen>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: String,
    ) -> axum::response::Response {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        seen.lock().push((method.clone(), uri.to_string(), auth, body));

        match (method, uri.path()) {
            (Method::GET, "/v4/loadtracks") => {
                Json(json!({ "loadType": "empty", "data": {} })).into_response()
            }
            (Method::DELETE, path) => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "timestamp": 1,
                    "status": 404,
                    "error": "Not Found",
                    "message": "Session not found",
                    "path": path,
                })),
            )
                .into_response(),
            (Method::PATCH, path) if path.starts_with("/v4/sessions/broken") => {
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
            _ => StatusCode::NO_CONTENT.into_response(),
        }
    }

    async fn serve() -> (RestClient, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .fallback(lavalink)
            .with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = NodeConfig {
            name: "local".into(),
            host: "127.0.0.1".into(),
            port,
            password: "youshallnotpass".into(),
            secure: false,
        };
        (RestClient::new(&config, "open-music-link/test").unwrap(), seen)
    }

    #[tokio::test]
    async fn test_update_player_sends_no_replace_and_auth() {
        let (client, seen) = serve().await;

        client
            .update_player("s1", GuildId::new(7), &UpdatePlayer::stop(), true)
            .await
            .unwrap();

        let seen = seen.lock().clone();
        let (method, uri, auth, body) = &seen[0];
        assert_eq!(method, &Method::PATCH);
        assert_eq!(uri, "/v4/sessions/s1/players/7?noReplace=true");
        assert_eq!(auth.as_deref(), Some("youshallnotpass"));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(body).unwrap(),
            serde_json::to_value(UpdatePlayer::stop()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_update_session_and_load_tracks_urls() {
        let (client, seen) = serve().await;

        client
            .update_session("s1", &UpdateSession { resuming: true, timeout: 60 })
            .await
            .unwrap();
        let result = client.load_tracks("ytsearch:never gonna").await.unwrap();
        assert_eq!(result, LoadResult::Empty);

        let seen = seen.lock().clone();
        assert_eq!(seen[0].1, "/v4/sessions/s1");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&seen[0].3).unwrap(),
            json!({ "resuming": true, "timeout": 60 })
        );
        assert_eq!(seen[1].0, Method::GET);
        assert_eq!(seen[1].1, "/v4/loadtracks?identifier=ytsearch%3Anever+gonna");
    }

    #[tokio::test]
    async fn test_error_body_maps_to_rest_error() {
        let (client, _) = serve().await;

        let err = client
            .destroy_player("s1", GuildId::new(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rest { status: 404, ref message }
                if message == "Session not found (/v4/sessions/s1/players/7)"
        ));

        // Sin cuerpo JSON se usa la razón del estado HTTP
        let err = client
            .update_session("broken", &UpdateSession { resuming: true, timeout: 60 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rest { status: 503, ref message } if message == "Service Unavailable"
        ));
    }
}

//! Хранилище поверх PostgREST (Supabase REST API).
//!
//! Таблица `calls`: `id`, `offer`, `answer`, `caller_ice`, `callee_ice`.
//! Изменения отслеживаются опросом: подписчик получает запись целиком каждый раз,
//! когда она отличается от последней доставленной.

use crate::config::StoreConfig;
use crate::error::{Result, SignalingError};
use crate::peer::types::{CallId, IceCandidate};
use crate::store::{CallRecord, RendezvousStore, Side, Subscription, Unsubscribe};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

const REST_PREFIX: &str = "rest/v1";

/// Строка таблицы в том виде, как её видит веб-клиент
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct CallRow {
    id: Value,
    #[serde(default)]
    offer: Option<String>,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    caller_ice: Option<Vec<IceCandidate>>,
    #[serde(default)]
    callee_ice: Option<Vec<IceCandidate>>,
}

impl From<CallRow> for CallRecord {
    fn from(row: CallRow) -> Self {
        // id может быть uuid или serial
        let id = match row.id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        CallRecord {
            id: CallId::from(id),
            offer: row.offer,
            answer: row.answer,
            initiator_candidates: row.caller_ice.unwrap_or_default(),
            responder_candidates: row.callee_ice.unwrap_or_default(),
        }
    }
}

fn column(side: Side) -> &'static str {
    match side {
        Side::Initiator => "caller_ice",
        Side::Responder => "callee_ice",
    }
}

#[derive(Clone)]
pub struct PostgrestStore {
    client: Client,
    table_url: Url,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl PostgrestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let base = config.url.trim_end_matches('/');
        if base.is_empty() {
            return Err(SignalingError::Config("store url is not set".into()));
        }
        let table_url = Url::parse(&format!("{base}/{REST_PREFIX}/{}", config.table))
            .map_err(|e| SignalingError::Config(format!("invalid store url {base}: {e}")))?;

        Ok(Self {
            client: Client::new(),
            table_url,
            api_key: config.api_key.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    fn row_url(&self, id: &CallId) -> Url {
        let mut url = self.table_url.clone();
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{id}"))
            .append_pair("select", "*");
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<CallRow>> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignalingError::Store(format!("{status}: {body}")));
        }
        Ok(response.json::<Vec<CallRow>>().await?)
    }

    async fn patch(&self, url: Url, body: Value) -> Result<Vec<CallRow>> {
        let request = self
            .client
            .patch(url)
            .header("Prefer", "return=representation")
            .json(&body);
        self.send_rows(request).await
    }
}

#[async_trait]
impl RendezvousStore for PostgrestStore {
    async fn create_record(&self, offer: &str) -> Result<CallId> {
        let body = json!([{ "offer": offer, "answer": null, "caller_ice": [], "callee_ice": [] }]);
        let request = self
            .client
            .post(self.table_url.clone())
            .header("Prefer", "return=representation")
            .json(&body);

        let row = self
            .send_rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SignalingError::Store("insert returned no row".into()))?;
        let record = CallRecord::from(row);
        debug!(call_id = %record.id, "call row created");
        Ok(record.id)
    }

    async fn fetch_record(&self, id: &CallId) -> Result<CallRecord> {
        let request = self.client.get(self.row_url(id));
        self.send_rows(request)
            .await?
            .into_iter()
            .next()
            .map(CallRecord::from)
            .ok_or_else(|| SignalingError::NotFound(id.clone()))
    }

    async fn write_candidates(&self, id: &CallId, side: Side, candidates: Vec<IceCandidate>) -> Result<()> {
        let mut body = Map::new();
        body.insert(column(side).to_string(), serde_json::to_value(candidates)?);

        let rows = self.patch(self.row_url(id), Value::Object(body)).await?;
        if rows.is_empty() {
            return Err(SignalingError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn set_answer(&self, id: &CallId, answer: &str) -> Result<()> {
        // условная запись: обновляем только пока answer пустой
        let mut url = self.row_url(id);
        url.query_pairs_mut().append_pair("answer", "is.null");

        let rows = self.patch(url, json!({ "answer": answer })).await?;
        if !rows.is_empty() {
            return Ok(());
        }
        // пусто: либо записи нет, либо answer уже записан
        self.fetch_record(id).await?;
        Err(SignalingError::State(format!("answer already set for call {id}")))
    }

    async fn subscribe(&self, id: &CallId) -> Result<Subscription> {
        let mut last = self.fetch_record(id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let id = id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(store.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.fetch_record(&id).await {
                    Ok(record) if record != last => {
                        last = record.clone();
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(SignalingError::NotFound(_)) => {
                        warn!(call_id = %id, "call row disappeared, stopping poll");
                        break;
                    }
                    Err(e) => warn!(call_id = %id, error = %e, "poll failed"),
                }
            }
        });

        Ok(Subscription {
            updates: rx,
            handle: Unsubscribe::new(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> StoreConfig {
        StoreConfig {
            url: url.into(),
            api_key: Some("anon".into()),
            ..Default::default()
        }
    }

    #[test]
    fn row_maps_columns_to_sides() {
        let row: CallRow = serde_json::from_value(json!({
            "id": "2f1c",
            "offer": "O1",
            "answer": null,
            "caller_ice": [{"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}],
            "callee_ice": []
        }))
        .unwrap();

        let record = CallRecord::from(row);
        assert_eq!(record.id, CallId::from("2f1c"));
        assert_eq!(record.offer.as_deref(), Some("O1"));
        assert_eq!(record.initiator_candidates.len(), 1);
        assert!(record.responder_candidates.is_empty());
    }

    #[test]
    fn numeric_ids_and_null_arrays_are_accepted() {
        let row: CallRow = serde_json::from_value(json!({
            "id": 42,
            "offer": "O1",
            "caller_ice": null
        }))
        .unwrap();

        let record = CallRecord::from(row);
        assert_eq!(record.id.as_str(), "42");
        assert!(record.initiator_candidates.is_empty());
        assert!(record.answer.is_none());
    }

    #[test]
    fn row_url_filters_by_id() {
        let store = PostgrestStore::new(&config("https://db.example.org/")).unwrap();
        let url = store.row_url(&CallId::from("abc"));
        assert_eq!(url.path(), "/rest/v1/calls");
        assert_eq!(url.query(), Some("id=eq.abc&select=*"));
    }

    #[test]
    fn missing_url_is_config_error() {
        assert!(matches!(
            PostgrestStore::new(&config("")),
            Err(SignalingError::Config(_))
        ));
    }

    #[test]
    fn candidate_columns() {
        assert_eq!(column(Side::Initiator), "caller_ice");
        assert_eq!(column(Side::Responder), "callee_ice");
    }
}

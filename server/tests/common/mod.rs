//! Shared helpers: an in-memory server on an ephemeral port.

#![allow(dead_code)]

use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use tandem_engine::{patch_from_value, ChangeEntry, Op};
use tandem_server::config::Config;
use tandem_server::db::EntryLog;
use tandem_server::{app, AppState};
use tokio::net::TcpListener;

pub fn config(vars: &[(&str, &str)]) -> Config {
    let mut map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    map.entry("DATABASE_URL".into())
        .or_insert_with(|| "memory:".into());
    Config::from_lookup(|key| map.get(key).cloned()).unwrap()
}

pub async fn spawn_server(config: Config) -> SocketAddr {
    let entries = EntryLog::memory(config.schema());
    let state = AppState::new(config, entries);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

pub fn ticket(id: &str, clock: u64, origin: &str) -> ChangeEntry {
    ChangeEntry::new(
        "tickets",
        id,
        Op::Create,
        patch_from_value(json!({"title": format!("Ticket {id}")})).unwrap(),
        clock,
        origin,
        1706745600000,
    )
}

//! Read-side aggregation of locations and the servers in them. Everything
//! here is recomputed from node and binding records on each request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::db::{EndNode, Location, UserBinding};
use crate::error::AppError;
use crate::fleet::FleetRegistry;
use crate::Result;

/// Users a single location is sized for.
const LOCATION_CAPACITY: usize = 100;
/// Users a single server is sized for.
const SERVER_CAPACITY: usize = 50;
/// Seconds without a health report before a server counts as stale.
const STALE_AFTER_SECS: i64 = 180;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LocationView {
    pub id: i32,
    pub country: String,
    pub city: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub server_count: usize,
    pub load_percentage: u32,
    pub estimated_latency_ms: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerView {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub status: String,
    pub health: String,
    pub user_count: usize,
    pub load_percentage: u32,
    pub last_seen: Option<DateTime<Utc>>,
    pub response_time_ms: Option<i32>,
}

fn percentage(count: usize, capacity: usize) -> u32 {
    let load = count.saturating_mul(100) / capacity;
    load.min(100) as u32
}

/// Rough round-trip estimate from how far the location is from the equator.
pub fn estimate_latency(latitude: f64) -> u32 {
    let distance = latitude.abs();
    if distance > 50.0 {
        150
    } else if distance > 30.0 {
        100
    } else {
        50
    }
}

pub fn health_status(node: &EndNode, now: DateTime<Utc>) -> String {
    match node.last_seen {
        None => "unknown".to_string(),
        Some(seen) if (now - seen).num_seconds() > STALE_AFTER_SECS => "stale".to_string(),
        Some(_) => node.status.clone(),
    }
}

fn users_per_node(bindings: &[UserBinding]) -> HashMap<&str, HashSet<&str>> {
    let mut users: HashMap<&str, HashSet<&str>> = HashMap::new();
    for binding in bindings {
        users
            .entry(binding.server_id.as_str())
            .or_default()
            .insert(binding.username.as_str());
    }
    users
}

pub fn summarize_locations(locations: &[Location], nodes: &[EndNode], bindings: &[UserBinding]) -> Vec<LocationView> {
    let users = users_per_node(bindings);

    locations
        .iter()
        .map(|location| {
            let here: Vec<&EndNode> = nodes
                .iter()
                .filter(|n| n.location_id == Some(location.id))
                .collect();
            let distinct_users: HashSet<&str> = here
                .iter()
                .filter_map(|n| users.get(n.id.as_str()))
                .flatten()
                .copied()
                .collect();

            LocationView {
                id: location.id,
                country: location.country.clone(),
                city: location.city.clone(),
                country_code: location.country_code.clone(),
                latitude: location.latitude,
                longitude: location.longitude,
                server_count: here.len(),
                load_percentage: percentage(distinct_users.len(), LOCATION_CAPACITY),
                estimated_latency_ms: estimate_latency(location.latitude),
            }
        })
        .collect()
}

pub fn servers_at(location_id: i32, nodes: &[EndNode], bindings: &[UserBinding], now: DateTime<Utc>) -> Vec<ServerView> {
    let users = users_per_node(bindings);

    nodes
        .iter()
        .filter(|n| n.location_id == Some(location_id))
        .map(|node| {
            let user_count = users.get(node.id.as_str()).map_or(0, HashSet::len);
            ServerView {
                server_id: node.id.clone(),
                host: node.host.clone(),
                port: node.port,
                status: node.status.clone(),
                health: health_status(node, now),
                user_count,
                load_percentage: percentage(user_count, SERVER_CAPACITY),
                last_seen: node.last_seen,
                response_time_ms: node.last_response_ms,
            }
        })
        .collect()
}

impl FleetRegistry {
    pub async fn location_overview(&self) -> Result<Vec<LocationView>> {
        let locations = self.locations().await?;
        let nodes = self.nodes().await?;
        let bindings = self.list_bindings().await?;
        Ok(summarize_locations(&locations, &nodes, &bindings))
    }

    pub async fn location_servers(&self, location_id: i32) -> Result<Vec<ServerView>> {
        let locations = self.locations().await?;
        if !locations.iter().any(|l| l.id == location_id) {
            return Err(AppError::NotFound(format!("Location {} not found", location_id)));
        }
        let nodes = self.nodes().await?;
        let bindings = self.list_bindings().await?;
        Ok(servers_at(location_id, &nodes, &bindings, Utc::now()))
    }
}

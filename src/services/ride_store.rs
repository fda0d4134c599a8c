// src/services/ride_store.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{
        decode_ride, ActorRole, NewRide, RideChange, RideEvent, RideFilter, RideId, RidePatch,
        RideRequest, RideRequestInit, RideStatus, SCHEMA_VERSION,
    },
    utils::id_generator::generate_ride_id,
};

const CHANGE_FEED_CAPACITY: usize = 1024;
const PATCH_ATTEMPTS: usize = 3;

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    VersionMismatch,
    Missing,
}

/// One item of a backend's change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Change(RideChange),
    /// The feed dropped changes; subscribers must re-read.
    Resync,
}

/// Storage backend for ride documents. Implementations own admission
/// (one active ride per passenger and per driver) and publish every
/// committed write on their change feed.
#[async_trait]
pub trait RideRecords: Send + Sync {
    async fn insert(&self, ride: &RideRequest) -> DispatchResult<()>;
    async fn fetch(&self, ride_id: &str) -> DispatchResult<Option<RideRequest>>;
    /// Replace `previous` with `next` if the stored version still equals
    /// `previous.version`. Terminal writes release the admission claims.
    async fn compare_and_swap(
        &self,
        previous: &RideRequest,
        next: &RideRequest,
    ) -> DispatchResult<CasOutcome>;
    async fn scan(&self, filter: &RideFilter) -> DispatchResult<Vec<RideRequest>>;
    async fn changes(&self) -> DispatchResult<BoxStream<'static, FeedItem>>;
}

// ------------------------------
// In-memory backend
// ------------------------------

#[derive(Default)]
struct MemoryInner {
    rides: HashMap<RideId, RideRequest>,
    claims: HashMap<(ActorRole, String), RideId>,
}

impl MemoryInner {
    fn active_holder(&self, role: ActorRole, user_id: &str) -> Option<RideId> {
        self.claims
            .get(&(role, user_id.to_string()))
            .filter(|ride_id| {
                self.rides
                    .get(*ride_id)
                    .is_some_and(|ride| !ride.status.is_terminal())
            })
            .cloned()
    }
}

pub struct MemoryRideStore {
    inner: RwLock<MemoryInner>,
    changes: broadcast::Sender<RideChange>,
}

impl MemoryRideStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: RwLock::new(MemoryInner::default()),
            changes,
        }
    }

    fn publish(&self, change: RideChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryRideStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RideRecords for MemoryRideStore {
    async fn insert(&self, ride: &RideRequest) -> DispatchResult<()> {
        let mut inner = self.inner.write().await;

        if inner.rides.contains_key(&ride.id) {
            return Err(DispatchError::conflict(format!("ride {} already exists", ride.id)));
        }
        for (party, user_id) in [
            (ActorRole::Passenger, &ride.passenger_id),
            (ActorRole::Driver, &ride.driver_id),
        ] {
            if let Some(held) = inner.active_holder(party, user_id) {
                return Err(DispatchError::ActiveRideExists {
                    party,
                    user_id: user_id.clone(),
                    ride_id: Some(held),
                });
            }
        }

        inner.rides.insert(ride.id.clone(), ride.clone());
        inner
            .claims
            .insert((ActorRole::Passenger, ride.passenger_id.clone()), ride.id.clone());
        inner
            .claims
            .insert((ActorRole::Driver, ride.driver_id.clone()), ride.id.clone());

        // Published under the lock so feed order matches commit order
        self.publish(RideChange {
            previous: None,
            current: ride.clone(),
        });
        Ok(())
    }

    async fn fetch(&self, ride_id: &str) -> DispatchResult<Option<RideRequest>> {
        Ok(self.inner.read().await.rides.get(ride_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        previous: &RideRequest,
        next: &RideRequest,
    ) -> DispatchResult<CasOutcome> {
        let mut inner = self.inner.write().await;

        let stored = match inner.rides.get(&next.id) {
            Some(stored) => stored.clone(),
            None => return Ok(CasOutcome::Missing),
        };
        if stored.version != previous.version {
            return Ok(CasOutcome::VersionMismatch);
        }

        inner.rides.insert(next.id.clone(), next.clone());
        if next.status.is_terminal() {
            inner.claims.retain(|_, held| *held != next.id);
        }

        self.publish(RideChange {
            previous: Some(stored),
            current: next.clone(),
        });
        Ok(CasOutcome::Applied)
    }

    async fn scan(&self, filter: &RideFilter) -> DispatchResult<Vec<RideRequest>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rides
            .values()
            .filter(|ride| filter.matches(ride))
            .cloned()
            .collect())
    }

    async fn changes(&self) -> DispatchResult<BoxStream<'static, FeedItem>> {
        let receiver = self.changes.subscribe();
        Ok(stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(change) => Some((FeedItem::Change(change), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Ride change subscriber lagged, skipped {} changes", skipped);
                    Some((FeedItem::Resync, receiver))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed())
    }
}

// ------------------------------
// Redis backend
// ------------------------------

// KEYS: ride, passenger claim, driver claim, index
// ARGV: ride json, ride id, channel, change json, ride key prefix
const INSERT_SCRIPT: &str = r#"
local function holder(claim_key)
  local held = redis.call('GET', claim_key)
  if not held then return nil end
  local doc = redis.call('GET', ARGV[5] .. held)
  if not doc then return nil end
  local status = cjson.decode(doc)['status']
  if status == 'completed' or status == 'cancelled' or status == 'rejected' then
    return nil
  end
  return held
end

if redis.call('EXISTS', KEYS[1]) == 1 then
  return {'exists', ''}
end
local passenger_ride = holder(KEYS[2])
if passenger_ride then
  return {'passenger', passenger_ride}
end
local driver_ride = holder(KEYS[3])
if driver_ride then
  return {'driver', driver_ride}
end

redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SET', KEYS[3], ARGV[2])
redis.call('SADD', KEYS[4], ARGV[2])
redis.call('PUBLISH', ARGV[3], ARGV[4])
return {'ok', ''}
"#;

// KEYS: ride, passenger claim, driver claim
// ARGV: expected version, next json, terminal flag, ride id, channel, change json
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
local version = cjson.decode(current)['version']
if type(version) ~= 'number' then
  version = 0
end
if version ~= tonumber(ARGV[1]) then
  return 0
end

redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] == '1' then
  for i = 2, 3 do
    if redis.call('GET', KEYS[i]) == ARGV[4] then
      redis.call('DEL', KEYS[i])
    end
  end
end
redis.call('PUBLISH', ARGV[5], ARGV[6])
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn ride_prefix(&self) -> String {
        format!("{}:ride:", self.prefix)
    }

    pub fn ride(&self, ride_id: &str) -> String {
        format!("{}{}", self.ride_prefix(), ride_id)
    }

    pub fn index(&self) -> String {
        format!("{}:rides", self.prefix)
    }

    pub fn active_claim(&self, party: ActorRole, user_id: &str) -> String {
        format!("{}:active:{}:{}", self.prefix, party, user_id)
    }

    pub fn channel(&self) -> String {
        format!("{}:rides:changes", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("dispatch")
    }
}

pub struct RedisRideStore {
    client: Client,
    connection: MultiplexedConnection,
    keys: RedisKeys,
    insert_script: Script,
    cas_script: Script,
}

/// Open a client and a multiplexed connection, checked with PING.
pub async fn open_redis(redis_url: &str) -> DispatchResult<(Client, MultiplexedConnection)> {
    let client = Client::open(redis_url)
        .map_err(|e| DispatchError::RedisConnection(e.to_string()))?;
    let mut connection = client.get_multiplexed_tokio_connection().await?;

    let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
    if pong != "PONG" {
        return Err(DispatchError::RedisConnection(format!(
            "unexpected PING reply: {}",
            pong
        )));
    }

    tracing::info!("Connected to Redis at {}", redis_url);
    Ok((client, connection))
}

impl RedisRideStore {
    pub fn new(client: Client, connection: MultiplexedConnection, keys: RedisKeys) -> Self {
        Self {
            client,
            connection,
            keys,
            insert_script: Script::new(INSERT_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
        }
    }

    fn decode_document(&self, ride_id: &str, raw: &str) -> DispatchResult<RideRequest> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        decode_ride(ride_id, value)
    }
}

#[async_trait]
impl RideRecords for RedisRideStore {
    async fn insert(&self, ride: &RideRequest) -> DispatchResult<()> {
        let mut conn = self.connection.clone();
        let document = serde_json::to_string(ride)?;
        let change = serde_json::to_string(&RideChange {
            previous: None,
            current: ride.clone(),
        })?;

        let reply: Vec<String> = self
            .insert_script
            .key(self.keys.ride(&ride.id))
            .key(self.keys.active_claim(ActorRole::Passenger, &ride.passenger_id))
            .key(self.keys.active_claim(ActorRole::Driver, &ride.driver_id))
            .key(self.keys.index())
            .arg(document)
            .arg(&ride.id)
            .arg(self.keys.channel())
            .arg(change)
            .arg(self.keys.ride_prefix())
            .invoke_async(&mut conn)
            .await?;

        let outcome = reply.first().map(String::as_str).unwrap_or_default();
        let held = reply.get(1).cloned().filter(|id| !id.is_empty());
        match outcome {
            "ok" => Ok(()),
            "exists" => Err(DispatchError::conflict(format!("ride {} already exists", ride.id))),
            "passenger" => Err(DispatchError::ActiveRideExists {
                party: ActorRole::Passenger,
                user_id: ride.passenger_id.clone(),
                ride_id: held,
            }),
            "driver" => Err(DispatchError::ActiveRideExists {
                party: ActorRole::Driver,
                user_id: ride.driver_id.clone(),
                ride_id: held,
            }),
            other => Err(DispatchError::RedisQuery(format!(
                "unexpected insert reply: {}",
                other
            ))),
        }
    }

    async fn fetch(&self, ride_id: &str) -> DispatchResult<Option<RideRequest>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.ride(ride_id))
            .query_async(&mut conn)
            .await?;

        raw.map(|raw| self.decode_document(ride_id, &raw)).transpose()
    }

    async fn compare_and_swap(
        &self,
        previous: &RideRequest,
        next: &RideRequest,
    ) -> DispatchResult<CasOutcome> {
        let mut conn = self.connection.clone();
        let document = serde_json::to_string(next)?;
        let change = serde_json::to_string(&RideChange {
            previous: Some(previous.clone()),
            current: next.clone(),
        })?;
        let terminal = if next.status.is_terminal() { "1" } else { "0" };

        let reply: i64 = self
            .cas_script
            .key(self.keys.ride(&next.id))
            .key(self.keys.active_claim(ActorRole::Passenger, &next.passenger_id))
            .key(self.keys.active_claim(ActorRole::Driver, &next.driver_id))
            .arg(previous.version)
            .arg(document)
            .arg(terminal)
            .arg(&next.id)
            .arg(self.keys.channel())
            .arg(change)
            .invoke_async(&mut conn)
            .await?;

        Ok(match reply {
            1 => CasOutcome::Applied,
            0 => CasOutcome::VersionMismatch,
            _ => CasOutcome::Missing,
        })
    }

    async fn scan(&self, filter: &RideFilter) -> DispatchResult<Vec<RideRequest>> {
        if let Some(ride_id) = &filter.ride_id {
            return Ok(self
                .fetch(ride_id)
                .await?
                .filter(|ride| filter.matches(ride))
                .into_iter()
                .collect());
        }

        let mut conn = self.connection.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.index())
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.keys.ride(id)).collect();
        let documents: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut rides = Vec::new();
        for (ride_id, raw) in ids.iter().zip(documents) {
            let Some(raw) = raw else { continue };
            match self.decode_document(ride_id, &raw) {
                Ok(ride) if filter.matches(&ride) => rides.push(ride),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping undecodable ride {}: {}", ride_id, e),
            }
        }
        Ok(rides)
    }

    async fn changes(&self) -> DispatchResult<BoxStream<'static, FeedItem>> {
        let connection = self.client.get_async_connection().await?;
        let mut pubsub = connection.into_pubsub();
        pubsub.subscribe(self.keys.channel()).await?;

        Ok(pubsub
            .into_on_message()
            .filter_map(|message| async move {
                let payload: String = message.get_payload().ok()?;
                match serde_json::from_str::<RideChange>(&payload) {
                    Ok(change) => Some(FeedItem::Change(change)),
                    Err(e) => {
                        tracing::warn!("Dropping malformed ride change: {}", e);
                        None
                    }
                }
            })
            .boxed())
    }
}

// ------------------------------
// Store facade
// ------------------------------

/// The authoritative ride record store. Cheap to clone, injected into the
/// engine and the admin projections.
#[derive(Clone)]
pub struct RideStore {
    records: Arc<dyn RideRecords>,
}

impl RideStore {
    pub fn new(records: Arc<dyn RideRecords>) -> Self {
        Self { records }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRideStore::new()))
    }

    /// Validate and persist a new `pending` ride.
    pub async fn create(&self, init: RideRequestInit) -> DispatchResult<RideId> {
        let ride = self.create_ride(init.validate()?).await?;
        Ok(ride.id)
    }

    pub async fn create_ride(&self, new_ride: NewRide) -> DispatchResult<RideRequest> {
        let ride = RideRequest::new(generate_ride_id(), new_ride, Utc::now());
        self.records.insert(&ride).await?;
        tracing::info!(
            "Created ride {} for passenger {} and driver {}",
            ride.id,
            ride.passenger_id,
            ride.driver_id
        );
        Ok(ride)
    }

    pub async fn get(&self, ride_id: &str) -> DispatchResult<RideRequest> {
        tracing::debug!("Fetching ride: {}", ride_id);
        self.records
            .fetch(ride_id)
            .await?
            .ok_or_else(|| DispatchError::ride_not_found(ride_id))
    }

    /// Field-level patch. With `expected_status` the patch only applies
    /// while the ride is still in that status.
    pub async fn update(
        &self,
        ride_id: &str,
        patch: RidePatch,
        expected_status: Option<RideStatus>,
    ) -> DispatchResult<RideRequest> {
        for _ in 0..PATCH_ATTEMPTS {
            let current = self.get(ride_id).await?;
            if let Some(expected) = expected_status {
                if current.status != expected {
                    return Err(DispatchError::conflict(format!(
                        "expected ride {} to be {}, found {}",
                        ride_id, expected, current.status
                    )));
                }
            }

            let mut next = current.clone();
            patch.clone().apply_to(&mut next);
            match self.commit(&current, next).await {
                Err(DispatchError::Conflict(_)) => continue,
                result => return result,
            }
        }

        Err(DispatchError::conflict(format!(
            "ride {} kept changing during update",
            ride_id
        )))
    }

    /// Write `next` over `previous` if nobody else wrote in between.
    pub async fn commit(
        &self,
        previous: &RideRequest,
        mut next: RideRequest,
    ) -> DispatchResult<RideRequest> {
        next.version = previous.version + 1;
        next.schema_version = SCHEMA_VERSION;
        next.updated_at = Utc::now().max(previous.updated_at);

        match self.records.compare_and_swap(previous, &next).await? {
            CasOutcome::Applied => {
                tracing::debug!("Committed ride {} at version {}", next.id, next.version);
                Ok(next)
            }
            CasOutcome::VersionMismatch => Err(DispatchError::conflict(format!(
                "ride {} is no longer at version {}",
                previous.id, previous.version
            ))),
            CasOutcome::Missing => Err(DispatchError::ride_not_found(&previous.id)),
        }
    }

    /// One-shot query, newest first.
    pub async fn list(&self, filter: &RideFilter) -> DispatchResult<Vec<RideRequest>> {
        let mut rides = self.records.scan(filter).await?;
        rides.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(rides)
    }

    /// Snapshot of every matching ride, then a delta per change. A fresh
    /// snapshot follows whenever the backend feed drops changes. Dropping
    /// the stream ends the subscription.
    pub async fn subscribe(&self, filter: RideFilter) -> DispatchResult<BoxStream<'static, RideEvent>> {
        // Listen before the snapshot so nothing falls in between
        let changes = self.records.changes().await?;
        let snapshot = self.list(&filter).await?;

        let subscription = Subscription {
            seen: versions(&snapshot),
            changes,
            store: self.clone(),
            filter,
        };

        let head = stream::once(async move { RideEvent::Snapshot(snapshot) });
        let tail = stream::unfold(subscription, |mut sub| async move {
            let event = sub.next_event().await?;
            Some((event, sub))
        });

        Ok(head.chain(tail).boxed())
    }
}

struct Subscription {
    changes: BoxStream<'static, FeedItem>,
    store: RideStore,
    filter: RideFilter,
    /// Latest version delivered per ride.
    seen: HashMap<RideId, u64>,
}

impl Subscription {
    async fn next_event(&mut self) -> Option<RideEvent> {
        loop {
            match self.changes.next().await? {
                FeedItem::Change(change) => {
                    let id = change.current.id.clone();
                    let version = change.current.version;
                    if self.seen.get(&id).is_some_and(|seen| version <= *seen) {
                        continue;
                    }
                    self.seen.insert(id, version);
                    if let Some(event) = RideEvent::from_change(&self.filter, change) {
                        return Some(event);
                    }
                }
                FeedItem::Resync => match self.store.list(&self.filter).await {
                    Ok(rides) => {
                        tracing::info!("Resending snapshot of {} ride(s) after lag", rides.len());
                        self.seen = versions(&rides);
                        return Some(RideEvent::Snapshot(rides));
                    }
                    Err(e) => {
                        tracing::error!("Could not resync ride subscription: {}", e);
                        return None;
                    }
                },
            }
        }
    }
}

fn versions(rides: &[RideRequest]) -> HashMap<RideId, u64> {
    rides
        .iter()
        .map(|ride| (ride.id.clone(), ride.version))
        .collect()
}

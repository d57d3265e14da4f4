//! Track subscription command
//!
//! A dashboard reports that it is showing an entity. The entity is
//! remembered for the staleness sweep and any stale data types are queued
//! at subscription priority. Enqueue failures never reach the caller.

use mediator::Request;
use refreshq_common::{DataType, EntityKey};
use serde::{Deserialize, Serialize};

use crate::api::response::Acknowledged;
use crate::refresh::{Enqueuer, SubscriptionEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSubscriptionCommand {
    pub entity_key: EntityKey,
    pub data_types: Vec<DataType>,
}

impl Request<Acknowledged> for TrackSubscriptionCommand {}

impl From<TrackSubscriptionCommand> for SubscriptionEvent {
    fn from(command: TrackSubscriptionCommand) -> Self {
        SubscriptionEvent {
            entity_key: command.entity_key,
            data_types: command.data_types,
        }
    }
}

pub async fn handle(enqueuer: &Enqueuer, command: TrackSubscriptionCommand) -> Acknowledged {
    enqueuer.on_subscription(&command.into()).await;
    Acknowledged::ok()
}

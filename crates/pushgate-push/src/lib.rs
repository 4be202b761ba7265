//! Delivery core of the push gateway.
//!
//! A [`PushGateway`] accepts client connections through `pushgate-net`, pushes
//! messages down them and tracks every delivery to exactly one terminal
//! outcome. Outcomes fan out to an ordered chain of [`PushListener`]s;
//! broadcasts roll up into one completion event.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pushgate_net::ConnectionId;
//! use pushgate_push::{GatewayConfig, PushGateway, PushMessage, TracingListener};
//!
//! let gateway = PushGateway::new(GatewayConfig::default());
//! gateway.register_listener(Arc::new(TracingListener), 0);
//! gateway.init().unwrap();
//! gateway.start(|bound| println!("listening: {bound:?}")).unwrap();
//! gateway.dispatch(PushMessage::new(1, b"hello".to_vec()), ConnectionId(1)).unwrap();
//! ```

pub mod broadcast;
pub mod gateway;
pub mod listener;
pub mod message;
pub mod record;
pub mod republish;
pub mod tracker;

pub use broadcast::{BroadcastAggregator, BroadcastError};
pub use gateway::{DispatchError, GatewayConfig, PushGateway};
pub use listener::{
    BroadcastReport, DeliveryReport, ListenerChain, ListenerError, PushListener, TracingListener,
};
pub use message::{AckPolicy, BroadcastId, DeliveryKey, PushMessage};
pub use record::{Checkpoint, DeliveryOutcome, DeliveryRecord, DeliveryState, TimePoints};
pub use republish::{OutcomeEnvelope, OutcomePublisher, PublishError, RepublishListener};
pub use tracker::{DeliveryTracker, TrackError};

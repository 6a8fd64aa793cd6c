//! Discovery feed collaborator
//!
//! The subscription transport is external. The broker only needs a way to
//! register a callback for one service category and receive
//! `(server id, announcement)` events through it.

use crate::announcement::{Announcement, ServerId};
use std::sync::Arc;

/// Service category carrying storage server announcements
pub const STORAGE_SERVICE: &str = "storage";

/// Callback receiving announcements from a discovery feed
pub type AnnouncementCallback = Arc<dyn Fn(ServerId, Announcement) + Send + Sync>;

/// A source of dynamically discovered announcements
pub trait DiscoveryFeed: Send + Sync {
    /// Deliver every announcement for `service_name` to `callback`, in
    /// arrival order, until the feed is dropped
    fn subscribe_to(&self, service_name: &str, callback: AnnouncementCallback);
}

use crate::types::{FeedDescriptor, FeedType, RetryPolicy};
use std::time::Duration;
use url::Url;

/// A vehicle positions feed with a 20s interval and default retry settings.
pub fn feed(id: &str, url: &str) -> FeedDescriptor {
    FeedDescriptor {
        id: id.into(),
        name: format!("Test {id}"),
        url: Url::parse(url).unwrap(),
        feed_type: FeedType::VehiclePositions,
        agency_id: Some("test-agency".into()),
        agency_name: Some("Test Agency".into()),
        system_id: None,
        system_name: None,
        schedule_url: None,
        interval: Duration::from_secs(20),
        timeout: Duration::from_secs(5),
        retry: RetryPolicy::default(),
        auth: None,
    }
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use adaptive_optimizer::advisory::{AdvisoryError, AdvisoryPurpose, AdvisoryRequest, AdvisoryService};
use adaptive_optimizer::config::Settings;
use adaptive_optimizer::models::ContentRecord;
use adaptive_optimizer::optimize::Services;
use adaptive_optimizer::store::Store;

/// Replays canned replies in order, then fails every call with `Disabled`.
#[derive(Default)]
pub struct ScriptedAdvisor {
    replies: Mutex<VecDeque<Result<String, AdvisoryError>>>,
    seen: Mutex<Vec<AdvisoryPurpose>>,
}

impl ScriptedAdvisor {
    pub fn new(replies: Vec<Result<String, AdvisoryError>>) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.into()), seen: Mutex::new(Vec::new()) })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn purposes(&self) -> Vec<AdvisoryPurpose> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdvisoryService for ScriptedAdvisor {
    async fn complete(&self, request: AdvisoryRequest) -> Result<String, AdvisoryError> {
        self.seen.lock().unwrap().push(request.purpose);
        self.replies.lock().unwrap().pop_front().unwrap_or(Err(AdvisoryError::Disabled))
    }
}

pub fn services_with(advisor: Arc<ScriptedAdvisor>, settings: &Settings) -> Services {
    Services::build(Store::open_in_memory().unwrap(), advisor, settings)
}

pub fn services(advisor: Arc<ScriptedAdvisor>) -> Services {
    services_with(advisor, &Settings::default())
}

/// `n` content rows for `variant_id`, 10 views each, `engaged` of them liked once.
pub fn seed_variant_content(store: &Store, variant_id: &str, n: usize, engaged: usize, at: DateTime<Utc>) {
    for i in 0..n {
        let mut c = ContentRecord::new("thread", at);
        c.variant_id = Some(variant_id.to_string());
        c.views = 10;
        c.likes = u64::from(i < engaged);
        c.engagement_rate = c.likes as f64 / 10.0;
        store.record_content(&c).unwrap();
    }
}

/// `n` plain content rows published at `at`.
pub fn seed_content(store: &Store, n: usize, at: DateTime<Utc>) {
    for i in 0..n {
        let mut c = ContentRecord::new(if i % 2 == 0 { "thread" } else { "image" }, at);
        c.views = 100;
        c.likes = 5 + (i as u64 % 7);
        c.comments = 1;
        c.engagement_rate = (c.likes + c.comments) as f64 / 100.0;
        store.record_content(&c).unwrap();
    }
}

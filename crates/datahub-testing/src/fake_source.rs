//! A scripted [`DataSource`] for `DownloadJob` tests: a fixed item list
//! paged by cursor (a plain integer offset).

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use datahub_core::store::{Batch, DataSource, QueryResult};
use datahub_core::Result;

pub struct FakeDataSource {
    name: String,
    items: Vec<Value>,
    pulls: Mutex<u32>,
}

impl FakeDataSource {
    pub fn new(name: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            items,
            pulls: Mutex::new(0),
        }
    }

    pub fn pull_count(&self) -> u32 {
        *self.pulls.lock().expect("pull counter lock poisoned")
    }
}

#[async_trait]
impl DataSource for FakeDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_status(&self) -> Result<Value> {
        Ok(json!({ "item_count": self.items.len(), "source": self.name }))
    }

    async fn query(&self, _sql: &str) -> Result<QueryResult> {
        Ok(QueryResult::default())
    }

    fn schema(&self) -> Value {
        json!({ "fields": [] })
    }

    async fn pull_batch(&self, cursor: Option<Value>, n: usize) -> Result<Batch> {
        *self.pulls.lock().expect("pull counter lock poisoned") += 1;
        let offset = cursor.as_ref().and_then(|c| c.as_u64()).unwrap_or(0) as usize;
        let page: Vec<Value> = self.items.iter().skip(offset).take(n).cloned().collect();
        let next_offset = offset + page.len();
        let is_last = next_offset >= self.items.len();
        Ok(Batch {
            items: page,
            next_cursor: Some(json!(next_offset)),
            is_last,
        })
    }
}

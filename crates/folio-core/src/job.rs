//! Render jobs.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::ipc::JobId;

/// One caller's request to render a document.
///
/// Built with the `with_*` methods and moved into the queue on submission,
/// after which it cannot change.
#[derive(Debug, Clone)]
pub struct RenderJob {
    id: JobId,
    payload: String,
    options: Map<String, Value>,
    timeout: Option<Duration>,
}

impl RenderJob {
    /// Create a job for `payload` with a generated id and no options.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            payload: payload.into(),
            options: Map::new(),
            timeout: None,
        }
    }

    /// Use a caller-supplied correlation id.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set one renderer option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Merge a set of renderer options, replacing existing keys.
    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options.extend(options);
        self
    }

    /// Fail the job if the renderer has not answered within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Fill in renderer-wide defaults without overriding what the caller set.
    pub(crate) fn with_defaults(
        mut self,
        timeout: Option<Duration>,
        options: &Map<String, Value>,
    ) -> Self {
        if self.timeout.is_none() {
            self.timeout = timeout;
        }
        for (key, value) in options {
            self.options
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_differ() {
        let a = RenderJob::new("a");
        let b = RenderJob::new("b");
        assert_ne!(a.id(), b.id());
        assert!(a.timeout().is_none());
        assert!(a.options().is_empty());
    }

    #[test]
    fn test_defaults_do_not_override_caller() {
        let mut defaults = Map::new();
        defaults.insert("type".to_string(), Value::from("pdf"));
        defaults.insert("quality".to_string(), Value::from(75));

        let job = RenderJob::new("<p/>")
            .with_id(3u64)
            .with_option("type", "png")
            .with_timeout(Duration::from_secs(1))
            .with_defaults(Some(Duration::from_secs(15)), &defaults);

        assert_eq!(job.id(), &JobId::Number(3));
        assert_eq!(job.options()["type"], "png");
        assert_eq!(job.options()["quality"], 75);
        assert_eq!(job.timeout(), Some(Duration::from_secs(1)));

        let job = RenderJob::new("<p/>").with_defaults(Some(Duration::from_secs(15)), &defaults);
        assert_eq!(job.timeout(), Some(Duration::from_secs(15)));
        assert_eq!(job.options()["type"], "pdf");
    }
}

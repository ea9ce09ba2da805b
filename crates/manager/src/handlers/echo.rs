//! `EchoHandler`: counts from 1 to `n`, reporting progress on every step.
//!
//! Used to exercise the dispatch path end to end without touching any
//! external service.
//!
//! Parameters:
//! - `n` (required): number of steps
//! - `delay_ms`: pause before each step (default 0)
//! - `fail_at`: step at which to fail instead of reporting
//! - `name`: label put on progress events (default `"echo"`)

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::handler::DataSourceHandler;
use crate::progress::{NullSink, ProgressSink};
use crate::protocol::HandlerParams;

pub const NAME: &str = "EchoHandler";

#[derive(Debug, Clone, Deserialize)]
struct EchoParams {
    n: u64,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    fail_at: Option<u64>,
    #[serde(default = "default_label")]
    name: String,
}

fn default_label() -> String {
    "echo".into()
}

pub struct EchoHandler {
    params: EchoParams,
    sink: Arc<dyn ProgressSink>,
}

impl EchoHandler {
    pub fn from_params(params: HandlerParams) -> Result<Box<dyn DataSourceHandler>, HandlerError> {
        let params: EchoParams = serde_json::from_value(serde_json::Value::Object(params))
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;
        Ok(Box::new(Self {
            params,
            sink: Arc::new(NullSink),
        }))
    }
}

impl DataSourceHandler for EchoHandler {
    fn set_progress_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sink = sink;
    }

    fn fetch(&mut self) -> Result<(), HandlerError> {
        let EchoParams {
            n,
            delay_ms,
            fail_at,
            ref name,
        } = self.params;
        info!(n, delay_ms, "echo handler starting");

        let started = Instant::now();
        for step in 1..=n {
            if delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(delay_ms));
            }
            if fail_at == Some(step) {
                return Err(HandlerError::Failed(format!("echo asked to fail at step {step}")));
            }

            // Remaining time extrapolated from the average step so far.
            let per_step = started.elapsed().as_secs_f64() / step as f64;
            let estimated = per_step * (n - step) as f64;
            debug!(step, n, "echo step");
            self.sink.report(name, n, step, estimated);
        }

        info!(n, elapsed = ?started.elapsed(), "echo handler finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        ticks: Mutex<Vec<(String, u64, u64)>>,
    }

    impl ProgressSink for CollectingSink {
        fn report(&self, name: &str, total: u64, processed: u64, estimated_time: f64) {
            assert!(estimated_time >= 0.0);
            self.ticks
                .lock()
                .unwrap()
                .push((name.to_string(), total, processed));
        }
    }

    fn params(value: serde_json::Value) -> HandlerParams {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("test params must be an object"),
        }
    }

    #[test]
    fn reports_each_step() {
        let sink = Arc::new(CollectingSink::default());
        let mut handler = EchoHandler::from_params(params(json!({"n": 3, "name": "rows"}))).unwrap();
        handler.set_progress_sink(sink.clone());

        handler.fetch().unwrap();

        let ticks = sink.ticks.lock().unwrap();
        assert_eq!(
            *ticks,
            vec![
                ("rows".to_string(), 3, 1),
                ("rows".to_string(), 3, 2),
                ("rows".to_string(), 3, 3),
            ]
        );
    }

    #[test]
    fn zero_steps_reports_nothing() {
        let sink = Arc::new(CollectingSink::default());
        let mut handler = EchoHandler::from_params(params(json!({"n": 0}))).unwrap();
        handler.set_progress_sink(sink.clone());
        handler.fetch().unwrap();
        assert!(sink.ticks.lock().unwrap().is_empty());
    }

    #[test]
    fn fail_at_stops_early() {
        let sink = Arc::new(CollectingSink::default());
        let mut handler = EchoHandler::from_params(params(json!({"n": 5, "fail_at": 3}))).unwrap();
        handler.set_progress_sink(sink.clone());

        let err = handler.fetch().unwrap_err();
        assert!(err.to_string().contains("step 3"));
        assert_eq!(sink.ticks.lock().unwrap().len(), 2);
    }

    #[test]
    fn missing_n_is_invalid_params() {
        let err = EchoHandler::from_params(params(json!({"delay_ms": 5})))
            .err()
            .expect("construction must fail");
        assert!(matches!(err, HandlerError::InvalidParams(_)));
    }
}

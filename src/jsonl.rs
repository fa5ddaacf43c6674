use std::{
    fs::{create_dir_all, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use serde_json::{json, Value};

use crate::{
    clock,
    types::{Intent, Mode, OrderLeg},
};

/// Destination for structured event records.
pub trait EventSink: Send + Sync {
    fn write(&self, record: Value);
}

/// Append-only JSONL file sink. One JSON object per line; write errors are
/// reported through tracing rather than tearing down the trading loop.
pub struct JsonlSink {
    writer: Mutex<BufWriter<std::fs::File>>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for JsonlSink {
    fn write(&self, record: Value) {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(writer, "{record}") {
            tracing::warn!("event log write failed: {err}");
            return;
        }
        if let Err(err) = writer.flush() {
            tracing::warn!("event log flush failed: {err}");
        }
    }
}

/// Captures records in memory; used by tests and log self-checks.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Value> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemorySink {
    fn write(&self, record: Value) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// One structured domain event. Every record carries the full field set;
/// unset fields serialize as null so downstream tooling can rely on the
/// shape. `simulated` is emitted only when true: absence means real.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub event: &'static str,
    pub intent: Option<Intent>,
    pub source: Option<&'static str>,
    pub mode: Option<Mode>,
    pub reason: Option<String>,
    pub leg: Option<OrderLeg>,
    pub cycle_id: Option<u64>,
    pub client_id: Option<String>,
    pub exch_order_id: Option<String>,
    pub trade_id: Option<String>,
    pub data: Option<Value>,
    pub res: Option<Value>,
    pub simulated: bool,
}

impl EventRecord {
    pub fn new(event: &'static str) -> Self {
        Self {
            event,
            intent: None,
            source: None,
            mode: None,
            reason: None,
            leg: None,
            cycle_id: None,
            client_id: None,
            exch_order_id: None,
            trade_id: None,
            data: None,
            res: None,
            simulated: false,
        }
    }

    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn source(mut self, source: &'static str) -> Self {
        self.source = Some(source);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn leg(mut self, leg: OrderLeg) -> Self {
        self.leg = Some(leg);
        self
    }

    pub fn cycle_id(mut self, cycle_id: u64) -> Self {
        self.cycle_id = Some(cycle_id);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn maybe_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn exch_order_id(mut self, exch_order_id: impl Into<String>) -> Self {
        self.exch_order_id = Some(exch_order_id.into());
        self
    }

    pub fn maybe_exch_order_id(mut self, exch_order_id: Option<String>) -> Self {
        self.exch_order_id = exch_order_id;
        self
    }

    pub fn trade_id(mut self, trade_id: impl Into<String>) -> Self {
        self.trade_id = Some(trade_id.into());
        self
    }

    pub fn maybe_trade_id(mut self, trade_id: Option<String>) -> Self {
        self.trade_id = trade_id;
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn res(mut self, res: Value) -> Self {
        self.res = Some(res);
        self
    }

    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    fn into_value(self, ts_ms: i64) -> Value {
        let mut record = json!({
            "ts": ts_ms,
            "event": self.event,
            "intent": self.intent.map(Intent::as_str),
            "source": self.source,
            "mode": self.mode.map(Mode::as_str),
            "reason": self.reason,
            "leg": self.leg.map(OrderLeg::as_str),
            "cycle_id": self.cycle_id,
            "client_id": self.client_id,
            "exch_order_id": self.exch_order_id,
            "trade_id": self.trade_id,
            "data": self.data,
            "res": self.res,
        });
        if self.simulated {
            record["simulated"] = Value::Bool(true);
        }
        record
    }
}

/// Handle shared by every component that emits domain events.
#[derive(Clone)]
pub struct EventLog {
    sink: Arc<dyn EventSink>,
}

impl EventLog {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn log(&self, record: EventRecord) {
        self.log_at(clock::now_ms(), record);
    }

    pub fn log_at(&self, ts_ms: i64, record: EventRecord) {
        self.sink.write(record.into_value(ts_ms));
    }
}

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    gateway::ExchangeGateway,
    jsonl::{EventLog, EventRecord},
    types::FundingState,
};

/// Polls the funding rate on a fixed cadence and publishes the latest value.
///
/// A failed poll keeps the previous value in place; its timestamp is only
/// refreshed on success, so the staleness guard fires naturally when the
/// endpoint keeps erroring.
pub fn spawn_funding_monitor(
    gateway: Arc<dyn ExchangeGateway>,
    symbol: String,
    poll_interval: Duration,
    funding: watch::Sender<Option<FundingState>>,
    log: EventLog,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match gateway.get_funding_rate(&symbol).await {
                Ok(state) => {
                    log.log(
                        EventRecord::new("state")
                            .source("funding")
                            .reason("funding_update")
                            .data(json!({
                                "symbol": symbol,
                                "funding_rate": state.rate,
                                "next_settle_ms": state.next_settle_ms,
                            })),
                    );
                    let _ = funding.send_replace(Some(state));
                }
                Err(err) => {
                    tracing::warn!("funding poll failed: {err}");
                    log.log(
                        EventRecord::new("risk")
                            .source("funding")
                            .reason("funding_poll_error")
                            .data(json!({ "symbol": symbol, "error": err.to_string() })),
                    );
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::jsonl::MemorySink;

    struct FlakyGateway {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl ExchangeGateway for FlakyGateway {
        async fn subscribe_public_books(
            &self,
            _symbol: &str,
        ) -> crate::errors::GatewayResult<tokio::sync::mpsc::Receiver<crate::gateway::DepthUpdate>>
        {
            unimplemented!()
        }

        async fn subscribe_private(
            &self,
            _symbol: &str,
        ) -> crate::errors::GatewayResult<(
            tokio::sync::mpsc::Receiver<crate::gateway::PrivateEvent>,
            watch::Receiver<crate::gateway::ConnState>,
        )> {
            unimplemented!()
        }

        async fn get_funding_rate(
            &self,
            _symbol: &str,
        ) -> crate::errors::GatewayResult<FundingState> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                Ok(FundingState {
                    rate: 0.0003,
                    ts_ms: 100,
                    next_settle_ms: None,
                })
            } else {
                Err(crate::errors::GatewayError::Transport("boom".into()))
            }
        }

        async fn load_constraints(
            &self,
            _symbol: &str,
            _leg: crate::types::Leg,
        ) -> crate::errors::GatewayResult<crate::constraints::InstrumentConstraints> {
            unimplemented!()
        }

        async fn get_position_mode(&self) -> crate::errors::GatewayResult<String> {
            unimplemented!()
        }

        async fn set_position_mode(&self, _mode: &str) -> crate::errors::GatewayResult<()> {
            unimplemented!()
        }

        async fn place_order(
            &self,
            _req: &crate::gateway::OrderRequest,
        ) -> crate::errors::GatewayResult<crate::gateway::OrderAck> {
            unimplemented!()
        }

        async fn cancel_order(
            &self,
            _req: &crate::gateway::CancelRequest,
        ) -> crate::errors::GatewayResult<crate::gateway::CancelOutcome> {
            unimplemented!()
        }

        async fn open_orders(
            &self,
            _symbol: &str,
            _leg: crate::types::Leg,
        ) -> crate::errors::GatewayResult<Vec<crate::gateway::OpenOrder>> {
            unimplemented!()
        }

        async fn position_snapshot(&self, _symbol: &str) -> crate::errors::GatewayResult<f64> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn failed_poll_retains_previous_value() {
        let gateway = Arc::new(FlakyGateway {
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let sink = Arc::new(MemorySink::new());
        let (tx, rx) = watch::channel(None);
        let handle = spawn_funding_monitor(
            gateway,
            "ETHUSDT".into(),
            Duration::from_millis(5),
            tx,
            EventLog::new(sink.clone()),
        );

        // First poll succeeds, second fails; the published value must keep
        // the first poll's timestamp.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        let state = rx.borrow().expect("funding published");
        assert_eq!(state.ts_ms, 100);
        assert!(sink
            .records()
            .iter()
            .any(|rec| rec["reason"] == "funding_poll_error"));
    }
}

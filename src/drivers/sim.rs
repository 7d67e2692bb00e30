// =============================================================================
// Simulation broker — demo-mode execution with synthetic fills
// =============================================================================
//
// Demo mode routes every order here: no request leaves the process, fills
// are immediate at the requested entry price, and the account is a simple
// in-memory ledger. Duplicate submissions with the same trade id return the
// original deal reference, mirroring the idempotency contract of the live
// driver.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AccountSnapshot, BrokerDriver, BrokerPosition, CloseConfirmation, DealRef, OrderError,
    OrderRequest,
};
use crate::hub::MarketDataHub;
use crate::types::Candle;

struct SimState {
    balance: f64,
    /// deal_ref -> position
    positions: HashMap<String, BrokerPosition>,
    /// trade_id -> deal_ref (idempotent submission)
    deals_by_trade: HashMap<String, String>,
}

/// In-process broker used by demo mode and tests.
pub struct SimBroker {
    state: Mutex<SimState>,
    /// Used to price close confirmations from the latest tick when present.
    hub: Option<Arc<MarketDataHub>>,
}

impl SimBroker {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                balance: starting_balance,
                positions: HashMap::new(),
                deals_by_trade: HashMap::new(),
            }),
            hub: None,
        }
    }

    pub fn with_hub(starting_balance: f64, hub: Arc<MarketDataHub>) -> Self {
        Self {
            hub: Some(hub),
            ..Self::new(starting_balance)
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.state.lock().positions.len()
    }
}

#[async_trait]
impl BrokerDriver for SimBroker {
    async fn open_session(&self) -> Result<()> {
        info!("sim broker session opened");
        Ok(())
    }

    async fn refresh_session_if_expired(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_candles(
        &self,
        _instrument: &str,
        _timeframe: &str,
        _count: usize,
    ) -> Result<Vec<Candle>> {
        // The sim broker has no history service; warm start comes from the
        // store in demo mode.
        Ok(Vec::new())
    }

    async fn fetch_open_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.state.lock().positions.values().cloned().collect())
    }

    async fn place_market_order(
        &self,
        request: &OrderRequest,
    ) -> std::result::Result<DealRef, OrderError> {
        if request.size_lots <= 0.0 {
            return Err(OrderError::Rejected("non-positive size".into()));
        }

        let mut state = self.state.lock();

        if let Some(existing) = state.deals_by_trade.get(&request.trade_id) {
            debug!(
                trade_id = %request.trade_id,
                deal_ref = %existing,
                "duplicate order submission — returning original deal"
            );
            return Ok(DealRef(existing.clone()));
        }

        let deal_ref = Uuid::new_v4().to_string();
        state.positions.insert(
            deal_ref.clone(),
            BrokerPosition {
                deal_ref: deal_ref.clone(),
                instrument: request.instrument.clone(),
                direction: request.direction,
                size_lots: request.size_lots,
                entry_price: request.entry_price,
            },
        );
        state
            .deals_by_trade
            .insert(request.trade_id.clone(), deal_ref.clone());

        info!(
            trade_id = %request.trade_id,
            instrument = %request.instrument,
            direction = %request.direction,
            size_lots = request.size_lots,
            entry = request.entry_price,
            "sim fill"
        );

        Ok(DealRef(deal_ref))
    }

    async fn close_position(&self, deal_ref: &str) -> Result<CloseConfirmation> {
        let position = {
            let mut state = self.state.lock();
            match state.positions.remove(deal_ref) {
                Some(p) => p,
                None => bail!("unknown deal ref {deal_ref}"),
            }
        };

        let close_price = self
            .hub
            .as_ref()
            .and_then(|hub| hub.get_latest_tick(&position.instrument))
            .map(|t| match position.direction {
                crate::types::Direction::Long => t.bid,
                crate::types::Direction::Short => t.ask,
            });

        debug!(deal_ref, instrument = %position.instrument, ?close_price, "sim close");

        Ok(CloseConfirmation {
            deal_ref: deal_ref.to_string(),
            close_price,
        })
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot> {
        let state = self.state.lock();
        Ok(AccountSnapshot {
            balance: state.balance,
            equity: state.balance,
            margin_available: state.balance * 30.0,
            currency: "USD".into(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn order(trade_id: &str) -> OrderRequest {
        OrderRequest {
            trade_id: trade_id.into(),
            instrument: "EUR_USD".into(),
            direction: Direction::Long,
            size_lots: 0.1,
            entry_price: 1.0850,
            sl_distance_pips: 6.0,
            tp_distance_pips: 10.0,
        }
    }

    #[tokio::test]
    async fn fill_open_close_round_trip() {
        let broker = SimBroker::new(1000.0);
        let deal = broker.place_market_order(&order("t-1")).await.unwrap();
        assert_eq!(broker.open_position_count(), 1);

        let open = broker.fetch_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].instrument, "EUR_USD");

        let confirmation = broker.close_position(&deal.0).await.unwrap();
        assert_eq!(confirmation.deal_ref, deal.0);
        assert_eq!(broker.open_position_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_trade_id_does_not_duplicate_position() {
        let broker = SimBroker::new(1000.0);
        let first = broker.place_market_order(&order("t-1")).await.unwrap();
        let second = broker.place_market_order(&order("t-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.open_position_count(), 1);
    }

    #[tokio::test]
    async fn zero_size_is_rejected() {
        let broker = SimBroker::new(1000.0);
        let mut bad = order("t-1");
        bad.size_lots = 0.0;
        assert!(matches!(
            broker.place_market_order(&bad).await,
            Err(OrderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn close_unknown_deal_errors() {
        let broker = SimBroker::new(1000.0);
        assert!(broker.close_position("missing").await.is_err());
    }
}

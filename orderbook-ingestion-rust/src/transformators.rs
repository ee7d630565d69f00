use crate::pipeline::DataTransformator;
use crate::types::{BookTickerMessage, Delta, DeltaMessage, SymbolTick};
use crate::utils::{now_ms, parse_decimal};
use crate::Result;
use std::marker::PhantomData;

/// Expands a diff. depth message into one delta per changed level, bids first.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeltaTransformator;

impl DataTransformator<DeltaMessage, Delta> for DeltaTransformator {
    fn transform(&self, msg: DeltaMessage) -> Result<Vec<Delta>> {
        let symbol = msg.symbol.to_lowercase();
        let mut deltas = Vec::with_capacity(msg.bids.len() + msg.asks.len());
        let levels = msg
            .bids
            .iter()
            .map(|level| (level, true))
            .chain(msg.asks.iter().map(|level| (level, false)));
        for ([price, count], is_bid) in levels {
            deltas.push(Delta {
                timestamp_ms: msg.event_time,
                price: parse_decimal(price)?,
                count: parse_decimal(count)?,
                update_id: msg.update_id,
                first_update_id: msg.first_update_id,
                is_bid,
                symbol: symbol.clone(),
            });
        }
        Ok(deltas)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BookTickerTransformator;

impl DataTransformator<BookTickerMessage, SymbolTick> for BookTickerTransformator {
    fn transform(&self, msg: BookTickerMessage) -> Result<Vec<SymbolTick>> {
        Ok(vec![SymbolTick {
            update_id: msg.update_id,
            symbol: msg.symbol.to_lowercase(),
            bid_price: parse_decimal(&msg.bid_price)?,
            bid_quantity: parse_decimal(&msg.bid_quantity)?,
            ask_price: parse_decimal(&msg.ask_price)?,
            ask_quantity: parse_decimal(&msg.ask_quantity)?,
            timestamp_ms: msg.event_time.unwrap_or_else(now_ms),
        }])
    }
}

/// Passes an already-shaped record through unchanged.
pub struct NoChangeTransformator<T>(PhantomData<fn() -> T>);

impl<T> NoChangeTransformator<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for NoChangeTransformator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataTransformator<T, T> for NoChangeTransformator<T> {
    fn transform(&self, msg: T) -> Result<Vec<T>> {
        Ok(vec![msg])
    }
}

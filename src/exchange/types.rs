//! Type definitions for Bitunix REST API payloads.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the book an order rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The exchange's wire representation.
    pub fn as_order_side(&self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Parse the exchange's "BUY"/"SELL" strings.
    pub fn from_order_side(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Long),
            "SELL" => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Standard Bitunix response envelope. `code == 0` means success.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Everything needed to place one limit order with protective exits.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
    pub client_id: String,
}

/// Payload of a successful placement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// One resting order as reported by the pending-orders endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
}

/// Wrapper list returned by the pending-orders endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrderList {
    #[serde(default)]
    pub order_list: Vec<PendingOrder>,
}

/// One kline entry from the market/kline endpoint, oldest first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineEntry {
    pub time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub close: Decimal,
}

/// Futures account snapshot (single margin coin).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub margin_coin: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub available: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_wire_roundtrip() {
        assert_eq!(Side::Long.as_order_side(), "BUY");
        assert_eq!(Side::Short.as_order_side(), "SELL");
        assert_eq!(Side::from_order_side("buy"), Some(Side::Long));
        assert_eq!(Side::from_order_side("SELL"), Some(Side::Short));
        assert_eq!(Side::from_order_side("HOLD"), None);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn test_envelope_deserializes_with_string_decimals() {
        let json = r#"{
            "code": 0,
            "msg": "success",
            "data": { "orderList": [
                { "orderId": "123", "symbol": "BTCUSDT", "side": "BUY",
                  "price": "64250.5", "qty": "0.002" }
            ]}
        }"#;
        let resp: ApiResponse<PendingOrderList> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.code, 0);
        let list = resp.data.unwrap().order_list;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].price, dec!(64250.5));
        assert_eq!(list[0].qty, dec!(0.002));
    }

    #[test]
    fn test_placed_order_tolerates_missing_id() {
        let json = r#"{ "code": 0, "msg": "", "data": { "clientId": "abc" } }"#;
        let resp: ApiResponse<PlacedOrder> = serde_json::from_str(json).unwrap();
        assert!(resp.data.unwrap().order_id.is_none());
    }
}

//! Order-shape validation ahead of exchange submission.
//!
//! Exit and stop orders must be reduce-only, sized on the lot grid, priced
//! on the tick grid, and pointed opposite the position they protect. The
//! validator refuses anything else with a field-level reason; it never
//! mutates its input.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::types::{ContractSpec, OrderParams, OrderRole, OrderType, Side};
use rust_decimal::Decimal;

fn is_grid_multiple(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return false;
    }
    (value % step).is_zero()
}

fn check_size(params: &OrderParams, contract: &ContractSpec) -> EngineResult<()> {
    if params.size <= Decimal::ZERO {
        return Err(EngineError::invalid_order("size", "must be positive"));
    }
    if !is_grid_multiple(params.size, contract.lot_size) {
        return Err(EngineError::invalid_order(
            "size",
            format!("must be a multiple of lot size {}", contract.lot_size),
        ));
    }
    Ok(())
}

fn check_price_on_grid(
    field: &str,
    price: Decimal,
    contract: &ContractSpec,
) -> EngineResult<()> {
    if price <= Decimal::ZERO {
        return Err(EngineError::invalid_order(field, "must be positive"));
    }
    if !is_grid_multiple(price, contract.tick_size) {
        return Err(EngineError::invalid_order(
            field,
            format!("must be a multiple of tick size {}", contract.tick_size),
        ));
    }
    Ok(())
}

fn check_opposes_position(params: &OrderParams, position_side: Side) -> EngineResult<()> {
    if params.side != position_side.exit_order_side() {
        return Err(EngineError::invalid_order(
            "side",
            format!("must oppose the {} position", position_side),
        ));
    }
    Ok(())
}

/// Validates an order that closes (part of) a position.
pub fn validate_exit_order(
    params: &OrderParams,
    position_side: Side,
    contract: &ContractSpec,
) -> EngineResult<()> {
    if !params.reduce_only {
        return Err(EngineError::invalid_order(
            "reduce_only",
            "exit orders must be reduce-only",
        ));
    }
    check_opposes_position(params, position_side)?;
    check_size(params, contract)?;
    if let Some(price) = params.price {
        check_price_on_grid("price", price, contract)?;
    } else if params.order_type == OrderType::Limit {
        return Err(EngineError::invalid_order(
            "price",
            "limit exit requires a price",
        ));
    }
    Ok(())
}

/// Validates a protective stop order.
pub fn validate_stop_order(
    params: &OrderParams,
    position_side: Side,
    contract: &ContractSpec,
) -> EngineResult<()> {
    if params.order_type != OrderType::Stop {
        return Err(EngineError::invalid_order(
            "order_type",
            "stop orders must use the stop order type",
        ));
    }
    if !params.reduce_only {
        return Err(EngineError::invalid_order(
            "reduce_only",
            "stop orders must be reduce-only",
        ));
    }
    let Some(stop_price) = params.stop_price else {
        return Err(EngineError::invalid_order(
            "stop_price",
            "stop orders require a trigger price",
        ));
    };
    if params.stop_price_type.is_none() {
        return Err(EngineError::invalid_order(
            "stop_price_type",
            "stop orders require a trigger price type",
        ));
    }
    check_opposes_position(params, position_side)?;
    check_size(params, contract)?;
    check_price_on_grid("stop_price", stop_price, contract)?;
    Ok(())
}

/// Returns a fresh params value with role-appropriate flags forced.
///
/// For every closing role `reduce_only` is set; entry orders pass through
/// shape-normalized. The input is never returned as-is.
pub fn sanitize(params: &OrderParams, role: OrderRole) -> OrderParams {
    let mut sanitized = params.clone();
    match role {
        OrderRole::Entry => {
            sanitized.reduce_only = false;
            sanitized.stop_price = None;
            sanitized.stop_price_type = None;
        }
        OrderRole::Exit | OrderRole::StopLoss | OrderRole::TakeProfit => {
            sanitized.reduce_only = true;
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrderSide, TriggerPriceType};
    use rust_decimal_macros::dec;

    fn contract() -> ContractSpec {
        ContractSpec {
            symbol: "XBTUSDTM".to_string(),
            tick_size: dec!(0.1),
            lot_size: dec!(0.001),
            multiplier: dec!(1),
            min_order_qty: dec!(0.001),
            max_order_qty: dec!(1000),
            maintenance_margin_percent: dec!(0.5),
        }
    }

    fn stop_params() -> OrderParams {
        OrderParams {
            client_oid: "pos-1:sl:1".to_string(),
            symbol: "XBTUSDTM".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Stop,
            price: None,
            size: dec!(0.01),
            reduce_only: true,
            stop_price: Some(dec!(49750.0)),
            stop_price_type: Some(TriggerPriceType::MarkPrice),
            leverage: 10,
        }
    }

    #[test]
    fn test_valid_stop_order_passes() {
        assert!(validate_stop_order(&stop_params(), Side::Long, &contract()).is_ok());
    }

    #[test]
    fn test_stop_without_reduce_only_rejected() {
        let mut params = stop_params();
        params.reduce_only = false;
        let err = validate_stop_order(&params, Side::Long, &contract()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder { field, .. } if field == "reduce_only"));
    }

    #[test]
    fn test_stop_without_trigger_rejected() {
        let mut params = stop_params();
        params.stop_price = None;
        let err = validate_stop_order(&params, Side::Long, &contract()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder { field, .. } if field == "stop_price"));

        let mut params = stop_params();
        params.stop_price_type = None;
        let err = validate_stop_order(&params, Side::Long, &contract()).unwrap_err();
        assert!(
            matches!(err, EngineError::InvalidOrder { field, .. } if field == "stop_price_type")
        );
    }

    #[test]
    fn test_same_side_as_position_rejected() {
        let mut params = stop_params();
        params.side = OrderSide::Buy;
        let err = validate_stop_order(&params, Side::Long, &contract()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder { field, .. } if field == "side"));
    }

    #[test]
    fn test_off_grid_size_rejected() {
        let mut params = stop_params();
        params.size = dec!(0.0105);
        let err = validate_stop_order(&params, Side::Long, &contract()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder { field, .. } if field == "size"));
    }

    #[test]
    fn test_off_grid_stop_price_rejected() {
        let mut params = stop_params();
        params.stop_price = Some(dec!(49750.05));
        let err = validate_stop_order(&params, Side::Long, &contract()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOrder { field, .. } if field == "stop_price"));
    }

    #[test]
    fn test_exit_order_requires_reduce_only() {
        let mut params = stop_params();
        params.order_type = OrderType::Market;
        params.stop_price = None;
        params.stop_price_type = None;
        params.reduce_only = false;
        assert!(validate_exit_order(&params, Side::Long, &contract()).is_err());
        params.reduce_only = true;
        assert!(validate_exit_order(&params, Side::Long, &contract()).is_ok());
    }

    #[test]
    fn test_sanitize_forces_reduce_only_and_returns_new_value() {
        let mut params = stop_params();
        params.reduce_only = false;
        let sanitized = sanitize(&params, OrderRole::StopLoss);
        assert!(sanitized.reduce_only);
        // Original untouched.
        assert!(!params.reduce_only);
    }

    #[test]
    fn test_sanitize_strips_stop_fields_from_entry() {
        let params = stop_params();
        let sanitized = sanitize(&params, OrderRole::Entry);
        assert!(!sanitized.reduce_only);
        assert!(sanitized.stop_price.is_none());
        assert!(sanitized.stop_price_type.is_none());
    }
}

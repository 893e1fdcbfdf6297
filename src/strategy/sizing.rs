//! Price and size arithmetic shared by the algorithms.
//!
//! Amounts round down to the size step, prices to the nearest tick; both
//! operations are idempotent. Order sizes blend book depth and trailing
//! trade volume, jittered so resting orders do not look machine-made.

use chrono::NaiveDateTime;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::{BookLevel, Direction, ExecutionMode};

/// Snap a price to the nearest tick. Idempotent.
pub fn format_price(price: Decimal, price_precision: Decimal) -> Decimal {
    if price_precision <= Decimal::ZERO {
        return price;
    }
    ((price / price_precision)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * price_precision)
        .normalize()
}

/// Floor an amount to the size step. Idempotent.
pub fn format_amount(amount: Decimal, size_precision: Decimal) -> Decimal {
    if size_precision <= Decimal::ZERO {
        return amount;
    }
    ((amount / size_precision).floor() * size_precision).normalize()
}

/// Lift an amount to a tradable size: zero stays zero, anything below the
/// minimum is raised to the smallest step at or above it.
pub fn amount_adjust(amount: Decimal, size_precision: Decimal, min_size: Decimal) -> Decimal {
    if amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if amount >= min_size + size_precision {
        return amount;
    }
    if size_precision <= Decimal::ZERO {
        return min_size;
    }
    ((min_size / size_precision).ceil() * size_precision).normalize()
}

/// Exchange minimum order size in base units: the larger of the
/// base-denominated and quote-denominated minimums.
pub fn min_order_size(base_min: Decimal, quote_min: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return base_min;
    }
    base_min.max(quote_min / price)
}

/// Ceil a size up to the size step.
pub fn ceil_to_step(size: Decimal, size_precision: Decimal) -> Decimal {
    if size_precision <= Decimal::ZERO {
        return size;
    }
    ((size / size_precision).ceil() * size_precision).normalize()
}

/// Offset relative to the reference price: one tick for passive
/// executions, half the spread for aggressive ones; negated for sells.
pub fn price_offset(
    direction: Direction,
    ask0: Decimal,
    bid0: Decimal,
    price_precision: Decimal,
    mode: ExecutionMode,
) -> Decimal {
    if bid0 <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let offset = match mode {
        ExecutionMode::Passive => price_precision / bid0,
        ExecutionMode::Aggressive => (ask0 - bid0) / bid0 / Decimal::TWO,
    };
    match direction {
        Direction::Sell => -offset,
        Direction::Buy => offset,
    }
}

/// Average level size over the top of the book.
pub fn ob_avg_size(levels: &[BookLevel], depth: usize) -> Decimal {
    let depth = depth.min(levels.len());
    if depth == 0 {
        return Decimal::ZERO;
    }
    let sum: Decimal = levels[..depth].iter().map(|l| l.size).sum();
    sum / Decimal::from(depth)
}

/// Walk the book until cumulative size exceeds the threshold; the price
/// reached is robust against dust orders planted at the touch. Without a
/// threshold the touch itself is returned. Inspects at most ten levels.
pub fn price_filter_by_volume(
    levels: &[BookLevel],
    volume_threshold: Option<Decimal>,
) -> (Decimal, Decimal) {
    let Some(threshold) = volume_threshold else {
        return levels
            .first()
            .map(|l| (l.price, l.size))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
    };
    let mut price = Decimal::ZERO;
    let mut size = Decimal::ZERO;
    for level in levels.iter().take(10) {
        size += level.size;
        price = level.price;
        if size > threshold {
            break;
        }
    }
    (price, size)
}

/// Top-of-book prices after filtering dust: walk up to `level` levels
/// until the cumulative size reaches `amount`.
pub fn orderbook_price_filter(
    bids: &[BookLevel],
    asks: &[BookLevel],
    amount: Decimal,
    level: usize,
) -> (Decimal, Decimal) {
    let walk = |side: &[BookLevel]| {
        let mut price = Decimal::ZERO;
        let mut count = Decimal::ZERO;
        for l in side.iter().take(level) {
            count += l.size;
            price = l.price;
            if count >= amount {
                break;
            }
        }
        price
    };
    (walk(bids), walk(asks))
}

/// Multiply by 1 + U(0, jitter); resting sizes should not repeat.
pub fn jitter(size: Decimal, jitter: Decimal) -> Decimal {
    let r = Decimal::from_f64(rand::thread_rng().gen::<f64>()).unwrap_or_default();
    size + size * jitter * r
}

/// Iceberg slice size: a 0.7/0.3 blend of book depth and trailing
/// one-minute trade volume, clamped to `[2*min, 0.5*max]` and jittered.
pub fn blend_order_size(
    ob_size: Decimal,
    trade_size: Decimal,
    min_size: Decimal,
    max_size: Option<Decimal>,
) -> Decimal {
    let mut size = Decimal::new(7, 1) * ob_size + Decimal::new(3, 1) * trade_size;
    if let Some(max_size) = max_size {
        size = size.min(max_size * Decimal::new(5, 1));
    }
    size = size.max(min_size * Decimal::TWO);
    jitter(size, Decimal::new(3, 1))
}

/// VWAP participation slice: our share of what the market traded in the
/// last minute, beyond what we already took, jittered.
pub fn participation_size(
    market_last_minute: Decimal,
    own_last_minute: Decimal,
    participation_ratio: Decimal,
) -> Decimal {
    let size = (market_last_minute - own_last_minute) * participation_ratio;
    if size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    jitter(size, Decimal::new(3, 1))
}

/// VWAP time-based slice: compare our executed fraction against the
/// market fraction of a projected total volume over the remaining window.
pub fn vwap_time_target(
    avg_minute_volume: Decimal,
    market_cum_volume: Decimal,
    end_time: NaiveDateTime,
    now: NaiveDateTime,
    total_size: Decimal,
    executed: Decimal,
) -> Decimal {
    if total_size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let minutes_remaining =
        Decimal::from((end_time - now).num_seconds().max(0)) / Decimal::from(60);
    let projected = avg_minute_volume * minutes_remaining + (total_size - executed)
        + market_cum_volume;
    if projected <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let target_ratio = market_cum_volume / projected;
    let real_ratio = executed / total_size;
    if target_ratio > real_ratio {
        (target_ratio - real_ratio) * total_size
    } else {
        Decimal::ZERO
    }
}

/// Hedge inventory the anchor leg must hold for the median leg's next
/// fill: twice the last median size, converted through the cross rate
/// when the mid coin is the median's quote.
pub fn maintain_amount(
    last_amount: Decimal,
    last_price: Decimal,
    median_base: &str,
    mid_coin: &str,
) -> Decimal {
    let amount = last_amount * Decimal::TWO;
    if mid_coin == median_base {
        amount
    } else {
        amount * last_price
    }
}

/// Implied price of the nominal pair from the two leg prices.
pub fn anchor_cross_price(
    median_price: Decimal,
    anchor_price: Decimal,
    symbol_base: &str,
    median_base: &str,
    symbol_quote: &str,
    anchor_quote: &str,
) -> Decimal {
    if median_price <= Decimal::ZERO || anchor_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let m = if symbol_base == median_base {
        median_price
    } else {
        Decimal::ONE / median_price
    };
    let a = if symbol_quote == anchor_quote {
        anchor_price
    } else {
        Decimal::ONE / anchor_price
    };
    m * a
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(raw: &[(f64, f64)]) -> Vec<BookLevel> {
        raw.iter()
            .map(|(p, s)| BookLevel {
                price: Decimal::from_f64(*p).unwrap(),
                size: Decimal::from_f64(*s).unwrap(),
            })
            .collect()
    }

    #[test]
    fn format_price_snaps_to_tick() {
        assert_eq!(format_price(dec!(0.005263), dec!(0.00001)), dec!(0.00526));
        assert_eq!(format_price(dec!(101.3), dec!(0.5)), dec!(101.5));
        assert_eq!(format_price(dec!(103), dec!(5)), dec!(105));
    }

    #[test]
    fn format_amount_floors() {
        assert_eq!(format_amount(dec!(152.58), dec!(0.1)), dec!(152.5));
        assert_eq!(format_amount(dec!(0.00999), dec!(0.001)), dec!(0.009));
    }

    #[test]
    fn formatting_is_idempotent() {
        let price = format_price(dec!(8822.4567), dec!(0.01));
        assert_eq!(format_price(price, dec!(0.01)), price);
        let amount = format_amount(dec!(5.23987), dec!(0.001));
        assert_eq!(format_amount(amount, dec!(0.001)), amount);
    }

    #[test]
    fn amount_adjust_lifts_small_sizes() {
        assert_eq!(amount_adjust(dec!(0.00365), dec!(0.0001), dec!(0.01534)), dec!(0.0154));
        assert_eq!(amount_adjust(dec!(0), dec!(0.01), dec!(0.1)), dec!(0));
        assert_eq!(amount_adjust(dec!(5), dec!(0.01), dec!(0.1)), dec!(5));
    }

    #[test]
    fn min_order_size_takes_the_larger_denomination()
    {
        assert_eq!(min_order_size(dec!(0.01), dec!(100), dec!(1000)), dec!(0.1));
        assert_eq!(min_order_size(dec!(0.5), dec!(100), dec!(1000)), dec!(0.5));
    }

    #[test]
    fn passive_offset_is_one_tick() {
        let offset = price_offset(
            Direction::Buy,
            dec!(101),
            dec!(100),
            dec!(0.01),
            ExecutionMode::Passive,
        );
        assert_eq!(offset, dec!(0.0001));
        let offset = price_offset(
            Direction::Sell,
            dec!(101),
            dec!(100),
            dec!(0.01),
            ExecutionMode::Passive,
        );
        assert_eq!(offset, dec!(-0.0001));
    }

    #[test]
    fn aggressive_offset_is_half_spread() {
        let offset = price_offset(
            Direction::Buy,
            dec!(102),
            dec!(100),
            dec!(0.01),
            ExecutionMode::Aggressive,
        );
        assert_eq!(offset, dec!(0.01));
    }

    #[test]
    fn volume_filter_skips_dust() {
        let asks = levels(&[(100.0, 0.1), (100.5, 0.2), (101.0, 5.0)]);
        let (price, size) = price_filter_by_volume(&asks, Some(dec!(1)));
        assert_eq!(price, dec!(101.0));
        assert!(size > dec!(1));
        let (touch, _) = price_filter_by_volume(&asks, None);
        assert_eq!(touch, dec!(100.0));
    }

    #[test]
    fn blend_respects_clamp() {
        // tiny inputs get lifted to 2x min before jitter
        let size = blend_order_size(dec!(0.001), dec!(0), dec!(1), Some(dec!(100)));
        assert!(size >= dec!(2));
        // huge inputs are capped at 0.5x max before jitter (jitter adds <= 30%)
        let size = blend_order_size(dec!(1000), dec!(1000), dec!(1), Some(dec!(100)));
        assert!(size <= dec!(65));
    }

    #[test]
    fn participation_size_is_nonnegative() {
        assert_eq!(participation_size(dec!(5), dec!(8), dec!(0.5)), dec!(0));
        let size = participation_size(dec!(10), dec!(2), dec!(0.5));
        assert!(size >= dec!(4) && size <= dec!(5.2));
    }

    #[test]
    fn vwap_time_target_zero_when_ahead() {
        use crate::util::time::parse_window_time;
        let now = parse_window_time("2019-10-12 12:00:00").unwrap();
        let end = parse_window_time("2019-10-12 13:00:00").unwrap();
        // executed fraction already above market fraction
        let size = vwap_time_target(dec!(10), dec!(1), end, now, dec!(100), dec!(90));
        assert_eq!(size, Decimal::ZERO);
        // behind the market: a positive catch-up slice
        let size = vwap_time_target(dec!(10), dec!(300), end, now, dec!(100), dec!(0));
        assert!(size > Decimal::ZERO);
    }

    #[test]
    fn maintain_amount_converts_through_price() {
        assert_eq!(maintain_amount(dec!(3), dec!(3.1), "BTC", "BTC"), dec!(6));
        assert_eq!(maintain_amount(dec!(3), dec!(2), "BTC", "EOS"), dec!(12));
    }

    #[test]
    fn cross_price_inverts_mismatched_legs() {
        // symbol BTCUSDT, median BTCEOS, anchor EOSUSDT
        let p = anchor_cross_price(dec!(200), dec!(0.5), "BTC", "BTC", "USDT", "USDT");
        assert_eq!(p, dec!(100));
        // median quoted the other way round
        let p = anchor_cross_price(dec!(0.005), dec!(0.5), "BTC", "EOS", "USDT", "USDT");
        assert_eq!(p, dec!(100));
    }
}

use super::types::{AnalyzerParams, ArbitrageResult, Opportunity};
use crate::models::QuoteSnapshot;
use std::cmp::Ordering;

/// Best spread and ranked cross-exchange opportunities over one quote set.
///
/// Quotes that are not OK, have a non-positive side, or come from a filtered
/// source are ignored. Returns an empty result when nothing is left.
pub fn analyze(quotes: &[QuoteSnapshot], params: &AnalyzerParams) -> ArbitrageResult {
    let valid: Vec<&QuoteSnapshot> = quotes
        .iter()
        .filter(|quote| is_valid(quote, params))
        .collect();

    let (Some(best_buy), Some(best_sell)) = (min_ask(&valid), max_bid(&valid)) else {
        return ArbitrageResult::default();
    };

    let spread_abs = best_sell.bid - best_buy.ask;
    let spread_pct = spread_abs / best_buy.ask * 100.0;

    ArbitrageResult {
        best_buy: Some(best_buy.clone()),
        best_sell: Some(best_sell.clone()),
        spread_abs,
        spread_pct,
        opportunities: rank_opportunities(&valid, params),
    }
}

fn is_valid(quote: &QuoteSnapshot, params: &AnalyzerParams) -> bool {
    quote.is_ok()
        && quote.bid > 0.0
        && quote.ask > 0.0
        && params.source_filter.is_none_or(|source| quote.source == source)
}

// first quote wins on ties
fn min_ask<'a>(quotes: &[&'a QuoteSnapshot]) -> Option<&'a QuoteSnapshot> {
    quotes.iter().copied().fold(None, |best, quote| match best {
        Some(b) if quote.ask >= b.ask => Some(b),
        _ => Some(quote),
    })
}

fn max_bid<'a>(quotes: &[&'a QuoteSnapshot]) -> Option<&'a QuoteSnapshot> {
    quotes.iter().copied().fold(None, |best, quote| match best {
        Some(b) if quote.bid <= b.bid => Some(b),
        _ => Some(quote),
    })
}

/// All ordered (buy, sell) combinations across distinct exchanges at or above
/// the minimum spread, best first.
fn rank_opportunities(quotes: &[&QuoteSnapshot], params: &AnalyzerParams) -> Vec<Opportunity> {
    let mut opportunities = Vec::new();
    for buy in quotes {
        for sell in quotes {
            if buy.exchange == sell.exchange {
                continue;
            }
            let spread_abs = sell.bid - buy.ask;
            let spread_pct = spread_abs / buy.ask * 100.0;
            if spread_pct < params.min_spread_pct {
                continue;
            }
            opportunities.push(Opportunity {
                buy_exchange: buy.exchange.clone(),
                buy_ask: buy.ask,
                sell_exchange: sell.exchange.clone(),
                sell_bid: sell.bid,
                spread_abs,
                spread_pct,
            });
        }
    }
    // stable, so equal spreads keep encounter order
    opportunities.sort_by(|a, b| b.spread_pct.partial_cmp(&a.spread_pct).unwrap_or(Ordering::Equal));
    opportunities.truncate(params.top_n);
    opportunities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuoteSource, QuoteStatus};

    fn quote(exchange: &str, bid: f64, ask: f64, source: QuoteSource) -> QuoteSnapshot {
        QuoteSnapshot::ok(
            exchange.into(),
            "BTC/USDT".into(),
            bid,
            ask,
            (bid + ask) / 2.0,
            source,
            "12:00:00".into(),
        )
    }

    fn http(exchange: &str, bid: f64, ask: f64) -> QuoteSnapshot {
        quote(exchange, bid, ask, QuoteSource::Http)
    }

    #[test]
    fn two_venue_spread_uses_buy_ask_base() {
        let quotes = vec![http("A", 100.0, 100.1), http("B", 100.5, 100.6)];
        let result = analyze(&quotes, &AnalyzerParams::default());

        let buy = result.best_buy.as_ref().unwrap();
        let sell = result.best_sell.as_ref().unwrap();
        assert_eq!((buy.exchange.as_str(), buy.ask), ("A", 100.1));
        assert_eq!((sell.exchange.as_str(), sell.bid), ("B", 100.5));
        assert_eq!(result.spread_abs, 100.5 - 100.1);
        assert!((result.spread_pct - 0.3996).abs() < 1e-4);

        let top = &result.opportunities[0];
        assert_eq!(top.buy_exchange.as_str(), "A");
        assert_eq!(top.sell_exchange.as_str(), "B");
        assert_eq!(top.spread_abs, top.sell_bid - top.buy_ask);
    }

    #[test]
    fn best_sides_bound_every_valid_quote() {
        let quotes = vec![
            http("A", 99.0, 99.4),
            http("B", 99.8, 100.2),
            http("C", 99.5, 99.3),
            http("D", 100.1, 100.9),
        ];
        let result = analyze(&quotes, &AnalyzerParams::default());
        let buy = result.best_buy.unwrap();
        let sell = result.best_sell.unwrap();
        assert!(quotes.iter().all(|q| buy.ask <= q.ask));
        assert!(quotes.iter().all(|q| sell.bid >= q.bid));
        assert_eq!(result.spread_abs, sell.bid - buy.ask);
    }

    #[test]
    fn invalid_quotes_are_ignored() {
        let failed = QuoteSnapshot::failed(
            "E".into(),
            "BTC/USDT".into(),
            QuoteStatus::Timeout,
            "timed out",
            QuoteSource::Http,
            "12:00:00".into(),
        );
        let quotes = vec![failed, http("Z", 0.0, 100.0), http("A", 100.0, 100.2)];
        let result = analyze(&quotes, &AnalyzerParams::default());
        assert_eq!(result.best_buy.unwrap().exchange.as_str(), "A");
        assert!(result.opportunities.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_result() {
        let result = analyze(&[], &AnalyzerParams::default());
        assert_eq!(result, ArbitrageResult::default());
    }

    #[test]
    fn single_venue_has_best_sides_but_no_opportunities() {
        let result = analyze(&[http("A", 100.0, 100.1)], &AnalyzerParams::default());
        assert!(result.best_buy.is_some() && result.best_sell.is_some());
        assert!(result.spread_abs < 0.0);
        assert!(result.opportunities.is_empty());
    }

    #[test]
    fn source_filter_keeps_streaming_quotes_only() {
        let quotes = vec![
            http("A", 101.0, 101.1),
            quote("B", 100.0, 100.1, QuoteSource::Ws),
            quote("C", 100.3, 100.4, QuoteSource::Ws),
        ];
        let params = AnalyzerParams {
            source_filter: Some(QuoteSource::Ws),
            ..AnalyzerParams::default()
        };
        let result = analyze(&quotes, &params);
        assert_eq!(result.best_sell.unwrap().exchange.as_str(), "C");
        assert!(result.opportunities.iter().all(|o| o.buy_exchange.as_str() != "A"));
    }

    #[test]
    fn opportunities_are_filtered_sorted_and_truncated() {
        let quotes = vec![
            http("A", 100.0, 100.1),
            http("B", 100.5, 100.6),
            http("C", 101.0, 101.1),
        ];
        let params = AnalyzerParams {
            min_spread_pct: 0.0,
            top_n: 2,
            ..AnalyzerParams::default()
        };
        let result = analyze(&quotes, &params);
        assert_eq!(result.opportunities.len(), 2);
        let first = &result.opportunities[0];
        assert_eq!((first.buy_exchange.as_str(), first.sell_exchange.as_str()), ("A", "C"));
        assert!(result.opportunities[0].spread_pct >= result.opportunities[1].spread_pct);
        assert!(result.opportunities.iter().all(|o| o.spread_pct >= 0.0));
    }

    #[test]
    fn ties_keep_first_seen_exchange() {
        let quotes = vec![http("A", 100.0, 100.2), http("B", 100.0, 100.2)];
        let result = analyze(&quotes, &AnalyzerParams::default());
        assert_eq!(result.best_buy.unwrap().exchange.as_str(), "A");
        assert_eq!(result.best_sell.unwrap().exchange.as_str(), "A");
    }
}

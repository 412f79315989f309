use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::llm::TokenUsage;

/// Read token counts from a provider's `usage` object.
///
/// Returns `None` when the body carries no usage metadata at all, so callers
/// can tell "zero tokens" from "not reported" when deciding whether to price
/// an attempt.
pub fn extract_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    if !usage.is_object() {
        return None;
    }

    let read = |primary: &str, alt: &str| {
        usage
            .get(primary)
            .or_else(|| usage.get(alt))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };

    let input = read("prompt_tokens", "input_tokens");
    let output = read("completion_tokens", "output_tokens");
    let total = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or_else(|| input.saturating_add(output));

    Some(TokenUsage {
        input,
        output,
        total,
    })
}

/// Published per-token pricing for a provider, in USD per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPricing {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

impl TokenPricing {
    /// gpt-3.5-turbo list price: $0.0015 / 1K input, $0.002 / 1K output.
    pub fn gpt35_turbo() -> Self {
        Self {
            input_per_1k: Decimal::new(15, 4),
            output_per_1k: Decimal::new(2, 3),
        }
    }

    /// Approximate cost of one attempt, rounded to the 6 decimal places the
    /// `cost` column stores.
    pub fn cost(&self, usage: &TokenUsage) -> Decimal {
        let thousand = Decimal::from(1000);
        let input = Decimal::from(usage.input) / thousand * self.input_per_1k;
        let output = Decimal::from(usage.output) / thousand * self.output_per_1k;
        (input + output).round_dp(6)
    }

    /// `cost`, or `None` when it would not fit the NUMERIC(10,6) column.
    pub fn recordable_cost(&self, usage: &TokenUsage) -> Option<Decimal> {
        Some(self.cost(usage)).filter(|c| *c <= max_recorded_cost())
    }
}

/// Largest value `api_usage_logs.cost` can hold.
pub fn max_recorded_cost() -> Decimal {
    Decimal::new(9_999_999_999, 6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_extract_usage_openai_fields() {
        let body = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}});
        assert_eq!(
            extract_usage(&body),
            Some(TokenUsage { input: 12, output: 30, total: 42 })
        );
    }

    #[test]
    fn test_extract_usage_missing_total_is_summed() {
        let body = json!({"usage": {"input_tokens": 5, "output_tokens": 7}});
        assert_eq!(
            extract_usage(&body),
            Some(TokenUsage { input: 5, output: 7, total: 12 })
        );
    }

    #[test]
    fn test_extract_usage_absent() {
        assert_eq!(extract_usage(&json!({"choices": []})), None);
        assert_eq!(extract_usage(&json!({"usage": null})), None);
    }

    #[test]
    fn test_extract_usage_partial_counts_default_to_zero() {
        let body = json!({"usage": {"prompt_tokens": 9}});
        assert_eq!(
            extract_usage(&body),
            Some(TokenUsage { input: 9, output: 0, total: 9 })
        );
    }

    #[test]
    fn test_extract_usage_huge_counts_do_not_overflow() {
        let body = json!({"usage": {"prompt_tokens": 4294967295u64, "completion_tokens": 1}});
        assert_eq!(
            extract_usage(&body),
            Some(TokenUsage { input: 4_294_967_295, output: 1, total: 4_294_967_296 })
        );

        let body = json!({"usage": {"prompt_tokens": u64::MAX, "completion_tokens": u64::MAX}});
        assert_eq!(extract_usage(&body).map(|u| u.total), Some(u64::MAX));
    }

    #[test]
    fn test_out_of_range_cost_is_not_recorded() {
        let pricing = TokenPricing::gpt35_turbo();
        let usage = TokenUsage { input: 10_000_000_000, output: 1, total: 10_000_000_001 };
        assert!(pricing.cost(&usage) > max_recorded_cost());
        assert_eq!(pricing.recordable_cost(&usage), None);

        let usage = TokenUsage { input: 1000, output: 500, total: 1500 };
        assert_eq!(pricing.recordable_cost(&usage), Some(Decimal::from_str("0.0025").unwrap()));
    }

    #[test]
    fn test_gpt35_pricing() {
        let pricing = TokenPricing::gpt35_turbo();
        let usage = TokenUsage { input: 1000, output: 500, total: 1500 };
        // 1000 * 0.0015/1K + 500 * 0.002/1K = 0.0015 + 0.001
        assert_eq!(pricing.cost(&usage), Decimal::from_str("0.0025").unwrap());
    }

    #[test]
    fn test_cost_rounds_to_six_places() {
        let pricing = TokenPricing::gpt35_turbo();
        let usage = TokenUsage { input: 1, output: 1, total: 2 };
        // 0.0000035 sits on the midpoint; round_dp rounds half to even
        assert_eq!(pricing.cost(&usage), Decimal::from_str("0.000004").unwrap());
    }
}

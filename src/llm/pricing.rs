//! 静态价目表与计费
//!
//! 单位：美元 / 百万 token（输入, 输出）。未知模型按保守默认价计，不报错。

/// 未知模型的默认价格
pub const DEFAULT_PRICING: (f64, f64) = (10.0, 30.0);

const MODEL_PRICING: &[(&str, (f64, f64))] = &[
    // OpenAI
    ("gpt-4-turbo-preview", (10.0, 30.0)),
    ("gpt-4-turbo", (10.0, 30.0)),
    ("gpt-4o", (5.0, 15.0)),
    ("gpt-4o-mini", (0.15, 0.60)),
    ("gpt-4", (30.0, 60.0)),
    ("gpt-3.5-turbo", (0.5, 1.5)),
    // Anthropic
    ("claude-3-opus-20240229", (15.0, 75.0)),
    ("claude-3-sonnet-20240229", (3.0, 15.0)),
    ("claude-3-haiku-20240307", (0.25, 1.25)),
    ("claude-3-5-sonnet-20241022", (3.0, 15.0)),
];

/// 查价：精确匹配模型 id，找不到返回 DEFAULT_PRICING
pub fn pricing_for(model: &str) -> (f64, f64) {
    MODEL_PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICING)
}

/// 是否在价目表中
pub fn is_known_model(model: &str) -> bool {
    MODEL_PRICING.iter().any(|(name, _)| *name == model)
}

/// 计算一次调用的费用（美元）
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_price, output_price) = pricing_for(model);
    (input_tokens as f64 / 1_000_000.0) * input_price
        + (output_tokens as f64 / 1_000_000.0) * output_price
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let cost = calculate_cost("gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        assert!(!is_known_model("some-new-model"));
        assert_eq!(pricing_for("some-new-model"), DEFAULT_PRICING);
        let cost = calculate_cost("some-new-model", 1_000, 0);
        assert!((cost - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_exact_match_only() {
        // gpt-4o 与 gpt-4o-mini 不可混淆
        assert_eq!(pricing_for("gpt-4o"), (5.0, 15.0));
        assert_eq!(pricing_for("gpt-4o-mini"), (0.15, 0.60));
    }
}

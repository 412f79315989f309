//! Canned replies used when no provider produced a usable response.

use rand::Rng;

/// Messages shorter than this (in characters) are echoed back whole.
pub const SHORT_MESSAGE_CHARS: usize = 50;
/// Longer messages are quoted up to this many characters.
pub const QUOTED_PREFIX_CHARS: usize = 100;

const TEMPLATES: [(&str, &str); 3] = [
    (
        "I understand you said: \"",
        "\". That's an interesting question! Unfortunately, the AI service is currently unavailable. Please try again in a few moments.",
    ),
    (
        "Thank you for your message! Your message was received: \"",
        "\". The AI service is temporarily unavailable. Please try again later.",
    ),
    (
        "I received your message: \"",
        "\". The AI service is experiencing issues right now. Please try again in a few moments.",
    ),
];

pub fn canned_response<R: Rng + ?Sized>(message: &str, rng: &mut R) -> String {
    if message.chars().count() < SHORT_MESSAGE_CHARS {
        return format!(
            "You said: \"{}\". The AI service is temporarily unavailable. Please try again later.",
            message
        );
    }

    let prefix: String = message.chars().take(QUOTED_PREFIX_CHARS).collect();
    let (head, tail) = TEMPLATES[rng.gen_range(0..TEMPLATES.len())];
    format!("{}{}{}", head, prefix, tail)
}

// Anthropic LLM driver for Weft

mod driver;

pub use driver::AnthropicDriver;

// OpenAI LLM driver for Weft

mod driver;

pub use driver::OpenAiDriver;

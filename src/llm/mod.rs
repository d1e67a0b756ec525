pub mod gateway;
pub mod tags;

pub use gateway::{HttpLlmGateway, LlmError, LlmGateway, LlmProtocol, LlmRequest};
pub use tags::{parse_llm_tags, ParsedTags};

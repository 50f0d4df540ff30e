pub mod image_fetcher;
pub mod llm_client;

pub use image_fetcher::{FetchedImage, HttpImageFetcher, ImageFetcher, ImageProxy};
pub use llm_client::{LlmBackend, OpenAiBackend, TokenStream, VisionBackend};

pub mod cleaner;
pub mod images;
pub mod llm;
pub mod signals;

pub use cleaner::HtmdDistiller;
pub use images::HtmlImageCollector;
pub use llm::OpenAiHydrator;
pub use signals::HtmlSignalExtractor;

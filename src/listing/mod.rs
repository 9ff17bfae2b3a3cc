pub mod extractor;
pub mod fields;
pub mod matcher;

//! Column descriptions for CSV formats, generated by `#[derive(CsvSchema)]`

pub use sharecgt_derive::CsvSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvField {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
    pub example: Option<&'static str>,
}

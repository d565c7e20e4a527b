//! `#[serde(serialize_with = "...")]` helper writing addresses as `0x`-prefixed
//! hex strings, which is how every address in a report is read.

use serde::Serializer;

pub fn serialize<S: Serializer>(value: &usize, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{value:#x}"))
}

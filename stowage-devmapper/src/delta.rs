//! Parser for `thin_delta` output.
//!
//! ```xml
//! <superblock uuid="" time="1" transaction="2" data_block_size="128" nr_data_blocks="0">
//!   <diff left="2" right="1">
//!     <same begin="0" length="4"/>
//!     <different begin="4" length="1"/>
//!   </diff>
//! </superblock>
//! ```
//!
//! `begin` and `length` count pool blocks.

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use stowage_common::{BlockExtent, BlockMapping, ExtentKind, StowageError, StowageResult};

fn extent_kind(tag: &[u8]) -> Option<ExtentKind> {
    match tag {
        b"same" => Some(ExtentKind::Same),
        b"different" => Some(ExtentKind::Different),
        b"left_only" => Some(ExtentKind::LeftOnly),
        b"right_only" => Some(ExtentKind::RightOnly),
        _ => None,
    }
}

fn invalid(msg: impl std::fmt::Display) -> StowageError {
    StowageError::Driver(format!("Invalid thin_delta output: {msg}"))
}

fn numeric_attribute(element: &BytesStart<'_>, name: &[u8]) -> StowageResult<u64> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(invalid)?;
        if attribute.key.as_ref() == name {
            let value = attribute.unescape_value().map_err(invalid)?;
            return value.trim().parse::<u64>().map_err(|e| {
                invalid(format!(
                    "attribute {} = {value:?}: {e}",
                    String::from_utf8_lossy(name)
                ))
            });
        }
    }
    Err(invalid(format!(
        "<{}> without {}",
        String::from_utf8_lossy(element.name().as_ref()),
        String::from_utf8_lossy(name)
    )))
}

/// Convert `thin_delta` XML into a byte-addressed mapping. `Same` extents are dropped unless
/// `include_same` is set.
pub fn parse_thin_delta(xml: &str, block_size: u64, include_same: bool) -> StowageResult<BlockMapping> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut mapping = BlockMapping::new(block_size, include_same);
    let mut in_diff = false;

    loop {
        match reader.read_event().map_err(invalid)? {
            Event::Start(e) if e.name().as_ref() == b"diff" => in_diff = true,
            Event::End(e) if e.name().as_ref() == b"diff" => in_diff = false,
            Event::Start(e) | Event::Empty(e) => {
                let Some(kind) = extent_kind(e.name().as_ref()) else {
                    continue;
                };
                if !in_diff {
                    return Err(invalid("extent outside of <diff>"));
                }
                if kind == ExtentKind::Same && !include_same {
                    continue;
                }
                let begin = numeric_attribute(&e, b"begin")?;
                let length = numeric_attribute(&e, b"length")?;
                mapping.push(BlockExtent {
                    offset: begin * block_size,
                    length: length * block_size,
                    kind,
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }

    mapping.extents.sort_by_key(|e| e.offset);
    Ok(mapping)
}

//! Cursor pagination over the tool list.
//!
//! Cursors are URL-safe base64 (no padding) of `{"o":<offset>}`. Anything
//! that does not decode to a non-negative integer offset is an invalid
//! cursor, reported as a data-plane error rather than an exception.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;

use cmb_core::BridgeError;
use cmb_upstream::ToolListEntry;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// One page, regrouped by server for display.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Page {
    pub servers: Vec<ServerGroup>,
    /// Size of the full pre-pagination list.
    #[serde(rename = "totalTools")]
    pub total_tools: usize,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ServerGroup {
    pub server: String,
    pub tools: Vec<ToolSummary>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

pub fn encode_cursor(offset: usize) -> String {
    URL_SAFE_NO_PAD.encode(format!("{{\"o\":{offset}}}"))
}

pub fn decode_cursor(cursor: &str) -> Result<usize, BridgeError> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| BridgeError::InvalidCursor)?;
    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|_| BridgeError::InvalidCursor)?;
    let offset = value.get("o").ok_or(BridgeError::InvalidCursor)?;
    // as_u64 rejects floats, negatives, strings and nulls in one go.
    offset
        .as_u64()
        .map(|o| o as usize)
        .ok_or(BridgeError::InvalidCursor)
}

/// Slice the half-open window `[offset, offset+page_size)` out of the list.
pub fn paginate_tool_list(
    entries: &[ToolListEntry],
    cursor: Option<&str>,
    page_size: Option<usize>,
) -> Result<Page, BridgeError> {
    let offset = match cursor {
        Some(cursor) => decode_cursor(cursor)?,
        None => 0,
    };
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let total = entries.len();
    let window = entries
        .iter()
        .skip(offset)
        .take(page_size);

    let mut servers: Vec<ServerGroup> = Vec::new();
    for entry in window {
        match servers.last_mut() {
            Some(group) if group.server == entry.server => group.tools.push(ToolSummary {
                name: entry.name.clone(),
                description: entry.description.clone(),
            }),
            _ => servers.push(ServerGroup {
                server: entry.server.clone(),
                tools: vec![ToolSummary {
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                }],
            }),
        }
    }

    let next_cursor = if offset + page_size < total {
        Some(encode_cursor(offset + page_size))
    } else {
        None
    };

    Ok(Page {
        servers,
        total_tools: total,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(count: usize) -> Vec<ToolListEntry> {
        (0..count)
            .map(|i| ToolListEntry {
                server: format!("srv{}", i / 4),
                name: format!("srv{}__tool{i}", i / 4),
                description: format!("tool number {i}"),
            })
            .collect()
    }

    #[test]
    fn cursor_round_trip() {
        assert_eq!(decode_cursor(&encode_cursor(0)).unwrap(), 0);
        assert_eq!(decode_cursor(&encode_cursor(123)).unwrap(), 123);
    }

    #[test]
    fn invalid_cursors_are_rejected() {
        for cursor in [
            "not-a-valid-cursor!!!",
            &URL_SAFE_NO_PAD.encode("{}"),
            &URL_SAFE_NO_PAD.encode("{\"o\":-1}"),
            &URL_SAFE_NO_PAD.encode("{\"o\":1.5}"),
            &URL_SAFE_NO_PAD.encode("{\"o\":\"4\"}"),
            &URL_SAFE_NO_PAD.encode("o=4"),
        ] {
            assert!(
                matches!(decode_cursor(cursor), Err(BridgeError::InvalidCursor)),
                "cursor {cursor:?} should be invalid"
            );
        }
    }

    #[test]
    fn eleven_tools_page_four_walks_as_4_4_3() {
        let list = entries(11);

        let first = paginate_tool_list(&list, None, Some(4)).unwrap();
        assert_eq!(page_len(&first), 4);
        assert_eq!(first.total_tools, 11);
        assert_eq!(first.next_cursor.as_deref(), Some(encode_cursor(4).as_str()));

        let second =
            paginate_tool_list(&list, first.next_cursor.as_deref(), Some(4)).unwrap();
        assert_eq!(page_len(&second), 4);
        assert_eq!(second.next_cursor.as_deref(), Some(encode_cursor(8).as_str()));

        let third =
            paginate_tool_list(&list, second.next_cursor.as_deref(), Some(4)).unwrap();
        assert_eq!(page_len(&third), 3);
        assert_eq!(third.next_cursor, None);
        assert_eq!(third.total_tools, 11);
    }

    #[test]
    fn walking_pages_yields_each_tool_exactly_once_in_order() {
        let list = entries(11);
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = paginate_tool_list(&list, cursor.as_deref(), Some(4)).unwrap();
            for group in &page.servers {
                for tool in &group.tools {
                    seen.push(tool.name.clone());
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let expected: Vec<String> = list.iter().map(|e| e.name.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn page_is_regrouped_by_server() {
        let list = entries(8);
        let page = paginate_tool_list(&list, None, Some(8)).unwrap();
        assert_eq!(page.servers.len(), 2);
        assert_eq!(page.servers[0].server, "srv0");
        assert_eq!(page.servers[0].tools.len(), 4);
        assert_eq!(page.servers[1].server, "srv1");
    }

    #[test]
    fn offset_past_the_end_yields_an_empty_page() {
        let list = entries(3);
        let page =
            paginate_tool_list(&list, Some(encode_cursor(10).as_str()), Some(4)).unwrap();
        assert!(page.servers.is_empty());
        assert_eq!(page.total_tools, 3);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn page_size_is_clamped() {
        let list = entries(10);
        let page = paginate_tool_list(&list, None, Some(10_000)).unwrap();
        assert_eq!(page_len(&page), 10);
    }

    fn page_len(page: &Page) -> usize {
        page.servers.iter().map(|group| group.tools.len()).sum()
    }
}

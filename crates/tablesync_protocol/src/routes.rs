//! REST routes of the remote table API.
//!
//! Paths are relative to the server's base URL. Both the client adapter and
//! the reference server build and parse them here so the two cannot drift.

use crate::ids::{RowId, TableId};

/// One endpoint of the remote table API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET tables/{t}`: schema and data ETags.
    TableState {
        /// Table id.
        table_id: TableId,
    },
    /// `GET tables/{t}/diff?data_etag=&cursor=&fetch_limit=`: one changeset page.
    Diff {
        /// Table id.
        table_id: TableId,
        /// Data ETag the client last committed.
        data_etag: Option<String>,
        /// Resume cursor from the previous page.
        cursor: Option<String>,
        /// Requested page size.
        fetch_limit: Option<usize>,
    },
    /// `PUT tables/{t}/rows`: batch push.
    AlterRows {
        /// Table id.
        table_id: TableId,
    },
    /// `GET tables/{t}/attachments/{row}/manifest`: row file manifest.
    Manifest {
        /// Table id.
        table_id: TableId,
        /// Row id.
        row_id: RowId,
    },
    /// `POST tables/{t}/attachments/{row}/upload`: multipart upload.
    Upload {
        /// Table id.
        table_id: TableId,
        /// Row id.
        row_id: RowId,
    },
    /// `POST tables/{t}/attachments/{row}/download`: multipart download.
    Download {
        /// Table id.
        table_id: TableId,
        /// Row id.
        row_id: RowId,
    },
}

impl Route {
    /// HTTP method of the route.
    pub fn method(&self) -> &'static str {
        match self {
            Route::TableState { .. } | Route::Diff { .. } | Route::Manifest { .. } => "GET",
            Route::AlterRows { .. } => "PUT",
            Route::Upload { .. } | Route::Download { .. } => "POST",
        }
    }

    /// Path and query, relative to the base URL.
    pub fn path(&self) -> String {
        let table = |t: &TableId| format!("tables/{}", encode_component(t.as_str()));
        let row = |t: &TableId, r: &RowId, leaf: &str| {
            format!(
                "{}/attachments/{}/{leaf}",
                table(t),
                encode_component(r.as_str())
            )
        };
        match self {
            Route::TableState { table_id } => table(table_id),
            Route::Diff {
                table_id,
                data_etag,
                cursor,
                fetch_limit,
            } => {
                let mut query = Vec::new();
                if let Some(etag) = data_etag {
                    query.push(format!("data_etag={}", encode_component(etag)));
                }
                if let Some(cursor) = cursor {
                    query.push(format!("cursor={}", encode_component(cursor)));
                }
                if let Some(limit) = fetch_limit {
                    query.push(format!("fetch_limit={limit}"));
                }
                let mut path = format!("{}/diff", table(table_id));
                if !query.is_empty() {
                    path.push('?');
                    path.push_str(&query.join("&"));
                }
                path
            }
            Route::AlterRows { table_id } => format!("{}/rows", table(table_id)),
            Route::Manifest { table_id, row_id } => row(table_id, row_id, "manifest"),
            Route::Upload { table_id, row_id } => row(table_id, row_id, "upload"),
            Route::Download { table_id, row_id } => row(table_id, row_id, "download"),
        }
    }

    /// Parses a path produced by [`Route::path`]. A leading `/` is ignored.
    pub fn parse(path_and_query: &str) -> Option<Route> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        let segments: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .map(decode_component)
            .collect::<Option<_>>()?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match segments.as_slice() {
            ["tables", t] => Some(Route::TableState {
                table_id: TableId::from(*t),
            }),
            ["tables", t, "diff"] => {
                let mut route = Route::Diff {
                    table_id: TableId::from(*t),
                    data_etag: None,
                    cursor: None,
                    fetch_limit: None,
                };
                if let Route::Diff {
                    data_etag,
                    cursor,
                    fetch_limit,
                    ..
                } = &mut route
                {
                    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
                        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                        let value = decode_component(value)?;
                        match key {
                            "data_etag" => *data_etag = Some(value),
                            "cursor" => *cursor = Some(value),
                            "fetch_limit" => *fetch_limit = value.parse().ok(),
                            _ => {}
                        }
                    }
                }
                Some(route)
            }
            ["tables", t, "rows"] => Some(Route::AlterRows {
                table_id: TableId::from(*t),
            }),
            ["tables", t, "attachments", r, leaf] => {
                let (table_id, row_id) = (TableId::from(*t), RowId::from(*r));
                match *leaf {
                    "manifest" => Some(Route::Manifest { table_id, row_id }),
                    "upload" => Some(Route::Upload { table_id, row_id }),
                    "download" => Some(Route::Download { table_id, row_id }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Percent-encodes everything outside the URL unreserved set.
pub fn encode_component(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Reverses [`encode_component`]. Returns `None` when the decoded bytes are
/// not UTF-8.
pub fn decode_component(value: &str) -> Option<String> {
    urlencoding::decode(value).ok().map(|decoded| decoded.into_owned())
}

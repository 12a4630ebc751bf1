//! Main table server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{HandlerContext, RequestHandler, ServerRequest, ServerResponse};
use crate::tables::ServerTables;
use std::sync::Arc;
use tablesync_protocol::{
    AlterRowsRequest, AlterRowsResponse, ChangesetPage, RemoteTableState, TableId,
};

/// The table server.
///
/// Serves the remote table API over in-memory tables. It does no socket
/// I/O; embed it behind any HTTP stack by converting requests into
/// [`ServerRequest`]s.
///
/// # Example
///
/// ```
/// use tablesync_server::{ServerConfig, ServerRequest, TableServer};
///
/// let server = TableServer::new(ServerConfig::default());
/// server.tables().create_table("visits", "schema-1");
///
/// let response = server.handle_http(&ServerRequest::new("GET", "tables/visits"));
/// assert_eq!(response.status, 200);
/// ```
pub struct TableServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl TableServer {
    /// Creates a new server with no tables.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_tables(config, Arc::new(ServerTables::new()))
    }

    /// Creates a server over existing table state.
    pub fn with_tables(config: ServerConfig, tables: Arc<ServerTables>) -> Self {
        let context = Arc::new(HandlerContext::new(config, tables));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the table state.
    pub fn tables(&self) -> &Arc<ServerTables> {
        &self.context.tables
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Issues a bearer token for `user`. Returns `None` without an auth secret.
    pub fn issue_token(&self, user: &str) -> Option<ServerResult<String>> {
        self.context
            .validator()
            .map(|validator| validator.create_token(user))
    }

    /// Makes every request fail with 503 until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.context.set_unavailable(unavailable);
    }

    /// Handles a table state request.
    pub fn handle_table_state(&self, table_id: &TableId) -> Result<RemoteTableState, String> {
        self.handler
            .handle_table_state(table_id)
            .map_err(|e| e.to_string())
    }

    /// Handles a diff request.
    pub fn handle_diff(
        &self,
        table_id: &TableId,
        data_etag: Option<&str>,
        cursor: Option<&str>,
        fetch_limit: Option<usize>,
    ) -> Result<ChangesetPage, String> {
        self.handler
            .handle_diff(table_id, data_etag, cursor, fetch_limit)
            .map_err(|e| e.to_string())
    }

    /// Handles a push request.
    pub fn handle_alter_rows(
        &self,
        table_id: &TableId,
        request: &AlterRowsRequest,
    ) -> Result<AlterRowsResponse, String> {
        self.handler
            .handle_alter_rows(table_id, request)
            .map_err(|e| e.to_string())
    }

    /// Handles a raw request (dispatches on its route).
    pub fn handle_http(&self, request: &ServerRequest) -> ServerResponse {
        self.handler.handle(request)
    }
}

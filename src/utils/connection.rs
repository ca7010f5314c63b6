//! PostgreSQL connection handling utilities
//!
//! Provides a safe wrapper around PostgreSQL's C library (libpq), and the
//! narrow traits the replication code talks to instead of libpq directly.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::binary::Oid;
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::ptr;
use tracing::debug;

/// Rows of a query result as text, with SQL NULL as `None`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub type_oids: Vec<Oid>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryRows {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of a named column in a row; `None` for NULL or a missing column
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Plain SQL access
pub trait SqlExecutor {
    fn query(&mut self, sql: &str) -> ReplicationResult<QueryRows>;
    fn execute(&mut self, sql: &str) -> ReplicationResult<()>;
}

/// Result of one non-blocking read from a COPY-both stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyData {
    Frame(Vec<u8>),
    /// No complete frame yet
    WouldBlock,
    /// The server ended the COPY
    Done,
}

/// COPY-both replication stream
pub trait ReplicationTransport {
    /// Run a command that must switch the connection into COPY-both mode
    fn start_copy_both(&mut self, sql: &str) -> ReplicationResult<()>;
    fn get_copy_data(&mut self) -> ReplicationResult<CopyData>;
    fn put_copy_data(&mut self, data: &[u8]) -> ReplicationResult<()>;
    fn flush(&mut self) -> ReplicationResult<()>;
}

/// Opens replication-mode connections for streaming
pub trait TransportConnector {
    type Transport: ReplicationTransport;

    fn connect_transport(&mut self) -> ReplicationResult<Self::Transport>;
}

/// Opens SQL connections, either regular or in replication mode
pub trait ConnectionFactory {
    type Connection: SqlExecutor;

    fn connect(&mut self) -> ReplicationResult<Self::Connection>;
    fn connect_replication(&mut self) -> ReplicationResult<Self::Connection>;
}

/// Append `replication=database` to a URI or key/value connection string
pub fn replication_conninfo(conninfo: &str) -> String {
    if conninfo.contains("replication=") {
        return conninfo.to_string();
    }

    let is_uri = conninfo.starts_with("postgres://") || conninfo.starts_with("postgresql://");
    if !is_uri {
        format!("{} replication=database", conninfo.trim_end())
    } else if conninfo.contains('?') {
        format!("{}&replication=database", conninfo)
    } else {
        format!("{}?replication=database", conninfo)
    }
}

/// Quote a SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an identifier
pub fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name part by part
pub fn quote_qualified(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_identifier(schema), quote_identifier(name)),
        None => quote_identifier(table),
    }
}

/// Safe wrapper for PostgreSQL connection using libpq
pub struct PGConnection {
    conn: *mut PGconn,
}

impl PGConnection {
    /// Establishes a connection to PostgreSQL using the provided connection info.
    ///
    /// # Arguments
    /// * `conninfo` - libpq connection string, URI or `key=value` pairs
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(ReplicationError::connection(
                "Failed to allocate connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = get_error_message(conn).unwrap_or("Unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(ReplicationError::connection(format!(
                "Connection failed: {}",
                error_msg.trim()
            )));
        }

        Ok(Self { conn })
    }

    fn is_bad(&self) -> bool {
        unsafe { PQstatus(self.conn) == ConnStatusType::CONNECTION_BAD }
    }

    fn last_error(&self) -> String {
        get_error_message(self.conn)
            .map(|m| m.trim().to_string())
            .unwrap_or("Unknown error".to_string())
    }

    /// Executes a query and wraps the raw result.
    ///
    /// A lost connection is reported as [`ReplicationError::ConnectionBroken`];
    /// the result status is left for the caller to check.
    pub fn exec(&self, query: &str) -> ReplicationResult<PGResult> {
        let c_query = CString::new(query)?;
        let result = PGResult {
            result: unsafe { PQexec(self.conn, c_query.as_ptr()) },
        };

        if result.result.is_null() || self.is_bad() {
            return Err(ReplicationError::connection_broken(format!(
                "Query execution failed: {}",
                self.last_error()
            )));
        }

        Ok(result)
    }

    /// Gets data from a COPY operation without blocking.
    ///
    /// libpq returns the row length, 0 when no complete row is buffered yet,
    /// -1 when the COPY is done and -2 on error. A returned buffer must be
    /// released with `PQfreemem`.
    fn read_copy_data(&self) -> ReplicationResult<CopyData> {
        let mut buffer: *mut libc::c_char = ptr::null_mut();
        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match copy_data_len {
            -2 => Err(ReplicationError::connection_broken(self.last_error())),
            -1 => {
                let result = PGResult {
                    result: unsafe { PQgetResult(self.conn) },
                };

                if !result.is_ok() {
                    return Err(ReplicationError::connection_broken(self.last_error()));
                }

                Ok(CopyData::Done)
            }
            0 => {
                // Pull whatever arrived on the socket for the next attempt
                if unsafe { PQconsumeInput(self.conn) } == 0 {
                    return Err(ReplicationError::connection_broken(self.last_error()));
                }
                Ok(CopyData::WouldBlock)
            }
            len => {
                if buffer.is_null() {
                    return Err(ReplicationError::protocol("Received null buffer"));
                }

                let data = unsafe {
                    std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec()
                };

                unsafe { PQfreemem(buffer as *mut libc::c_void) };
                Ok(CopyData::Frame(data))
            }
        }
    }
}

impl SqlExecutor for PGConnection {
    fn query(&mut self, sql: &str) -> ReplicationResult<QueryRows> {
        debug!(sql, "Running query");
        let result = self.exec(sql)?;
        if !result.is_ok() {
            return Err(ReplicationError::query(format!(
                "{}: {}",
                sql,
                result.error_message()
            )));
        }
        Ok(result.rows())
    }

    fn execute(&mut self, sql: &str) -> ReplicationResult<()> {
        self.query(sql).map(|_| ())
    }
}

impl ReplicationTransport for PGConnection {
    fn start_copy_both(&mut self, sql: &str) -> ReplicationResult<()> {
        let result = self.exec(sql)?;
        if result.status() != ExecStatusType::PGRES_COPY_BOTH {
            return Err(ReplicationError::protocol_with_context(
                format!("Server did not enter COPY-both mode: {}", result.error_message()),
                sql.to_string(),
            ));
        }
        Ok(())
    }

    fn get_copy_data(&mut self) -> ReplicationResult<CopyData> {
        self.read_copy_data()
    }

    fn put_copy_data(&mut self, data: &[u8]) -> ReplicationResult<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const libc::c_char,
                data.len() as i32,
            )
        };

        if result != 1 {
            return Err(ReplicationError::connection_broken(format!(
                "Failed to send copy data: {}",
                self.last_error()
            )));
        }

        Ok(())
    }

    fn flush(&mut self) -> ReplicationResult<()> {
        let result = unsafe { PQflush(self.conn) };
        if result != 0 {
            return Err(ReplicationError::connection_broken(format!(
                "Failed to flush connection: {}",
                self.last_error()
            )));
        }
        Ok(())
    }
}

impl Drop for PGConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error_ptr).to_string_lossy().into_owned())
        }
    }
}

/// Safe wrapper for PostgreSQL result.
pub struct PGResult {
    result: *mut PGresult,
}

impl PGResult {
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// True for PGRES_TUPLES_OK and PGRES_COMMAND_OK
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    pub fn fname(&self, col: i32) -> String {
        let name_ptr = unsafe { PQfname(self.result, col) };
        if name_ptr.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(name_ptr).to_string_lossy().into_owned() }
        }
    }

    pub fn ftype(&self, col: i32) -> Oid {
        unsafe { PQftype(self.result, col) }
    }

    /// Gets a value by row and column index; `None` for SQL NULL
    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        if unsafe { PQgetisnull(self.result, row, col) } == 1 {
            return None;
        }
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }

    pub fn error_message(&self) -> String {
        let error_ptr = unsafe { PQresultErrorMessage(self.result) };
        if error_ptr.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(error_ptr).to_string_lossy().trim().to_string() }
        }
    }

    /// Copy the whole result out of libpq
    pub fn rows(&self) -> QueryRows {
        let nfields = self.nfields();
        let columns = (0..nfields).map(|c| self.fname(c)).collect();
        let type_oids = (0..nfields).map(|c| self.ftype(c)).collect();
        let rows = (0..self.ntuples())
            .map(|row| (0..nfields).map(|col| self.getvalue(row, col)).collect())
            .collect();

        QueryRows {
            columns,
            type_oids,
            rows,
        }
    }
}

impl Drop for PGResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}

/// Opens libpq connections from one connection string
#[derive(Debug, Clone)]
pub struct LibpqConnector {
    conninfo: String,
}

impl LibpqConnector {
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
        }
    }
}

impl TransportConnector for LibpqConnector {
    type Transport = PGConnection;

    fn connect_transport(&mut self) -> ReplicationResult<PGConnection> {
        PGConnection::connect(&replication_conninfo(&self.conninfo))
    }
}

impl ConnectionFactory for LibpqConnector {
    type Connection = PGConnection;

    fn connect(&mut self) -> ReplicationResult<PGConnection> {
        PGConnection::connect(&self.conninfo)
    }

    fn connect_replication(&mut self) -> ReplicationResult<PGConnection> {
        PGConnection::connect(&replication_conninfo(&self.conninfo))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory connections

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub enum Reply {
        Rows(QueryRows),
        Fail(String),
        Broken,
    }

    impl Reply {
        /// Text-typed rows
        pub fn rows(columns: &[&str], rows: &[&[Option<&str>]]) -> Self {
            let typed: Vec<(&str, Oid)> = columns.iter().map(|c| (*c, 25)).collect();
            Self::typed(&typed, rows)
        }

        pub fn typed(columns: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> Self {
            Reply::Rows(QueryRows {
                columns: columns.iter().map(|(name, _)| name.to_string()).collect(),
                type_oids: columns.iter().map(|(_, oid)| *oid).collect(),
                rows: rows
                    .iter()
                    .map(|row| row.iter().map(|v| v.map(str::to_string)).collect())
                    .collect(),
            })
        }

        pub fn empty() -> Self {
            Reply::Rows(QueryRows::default())
        }
    }

    /// Answers statements by substring match. Replies queued for the same
    /// pattern are used in order and the last one repeats. Statements with
    /// no matching rule succeed with no rows. Clones share rules and log.
    #[derive(Clone, Default)]
    pub struct ScriptedSql {
        rules: Arc<Mutex<Vec<(String, VecDeque<Reply>)>>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedSql {
        pub fn on(self, pattern: &str, reply: Reply) -> Self {
            {
                let mut rules = self.rules.lock().unwrap();
                match rules.iter_mut().find(|(p, _)| p == pattern) {
                    Some((_, replies)) => replies.push_back(reply),
                    None => rules.push((pattern.to_string(), VecDeque::from([reply]))),
                }
            }
            self
        }

        pub fn executed(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        pub fn executed_matching(&self, pattern: &str) -> Vec<String> {
            self.executed()
                .into_iter()
                .filter(|sql| sql.contains(pattern))
                .collect()
        }

        fn record(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    impl SqlExecutor for ScriptedSql {
        fn query(&mut self, sql: &str) -> ReplicationResult<QueryRows> {
            self.record(sql);

            let reply = {
                let mut rules = self.rules.lock().unwrap();
                rules
                    .iter_mut()
                    .find(|(pattern, _)| sql.contains(pattern.as_str()))
                    .map(|(_, replies)| {
                        if replies.len() > 1 {
                            replies.pop_front().unwrap()
                        } else {
                            replies.front().cloned().unwrap()
                        }
                    })
            };

            match reply {
                Some(Reply::Rows(rows)) => Ok(rows),
                Some(Reply::Fail(message)) => Err(ReplicationError::query(message)),
                Some(Reply::Broken) => Err(ReplicationError::connection_broken("server closed the connection")),
                None => Ok(QueryRows::default()),
            }
        }

        fn execute(&mut self, sql: &str) -> ReplicationResult<()> {
            self.query(sql).map(|_| ())
        }
    }

    /// Hands out clones of one [`ScriptedSql`], logging each connect
    #[derive(Clone, Default)]
    pub struct ScriptedFactory {
        pub sql: ScriptedSql,
        pub refuse: bool,
    }

    impl ScriptedFactory {
        pub fn new(sql: ScriptedSql) -> Self {
            Self { sql, refuse: false }
        }
    }

    impl ConnectionFactory for ScriptedFactory {
        type Connection = ScriptedSql;

        fn connect(&mut self) -> ReplicationResult<ScriptedSql> {
            if self.refuse {
                return Err(ReplicationError::connection("connection refused"));
            }
            self.sql.record("<connect>");
            Ok(self.sql.clone())
        }

        fn connect_replication(&mut self) -> ReplicationResult<ScriptedSql> {
            if self.refuse {
                return Err(ReplicationError::connection("connection refused"));
            }
            self.sql.record("<connect replication>");
            Ok(self.sql.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_conninfo() {
        assert_eq!(
            replication_conninfo("postgres://u@localhost/db"),
            "postgres://u@localhost/db?replication=database"
        );
        assert_eq!(
            replication_conninfo("postgresql://u@localhost/db?sslmode=disable"),
            "postgresql://u@localhost/db?sslmode=disable&replication=database"
        );
        assert_eq!(
            replication_conninfo("host=localhost dbname=db "),
            "host=localhost dbname=db replication=database"
        );
        assert_eq!(
            replication_conninfo("host=localhost replication=database"),
            "host=localhost replication=database"
        );
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_identifier("my\"slot"), "\"my\"\"slot\"");
        assert_eq!(quote_qualified("public.students"), "\"public\".\"students\"");
        assert_eq!(quote_qualified("students"), "\"students\"");
    }

    #[test]
    fn test_query_rows_lookup() {
        let rows = QueryRows {
            columns: vec!["active".to_string(), "restart_lsn".to_string()],
            type_oids: vec![16, 3220],
            rows: vec![vec![Some("f".to_string()), None]],
        };
        assert_eq!(rows.value(0, "active"), Some("f"));
        assert_eq!(rows.value(0, "restart_lsn"), None);
        assert_eq!(rows.value(0, "missing"), None);
        assert_eq!(rows.value(1, "active"), None);
        assert_eq!(rows.len(), 1);
    }
}

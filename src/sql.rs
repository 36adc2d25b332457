use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAppointment(NewAppointment),
    UpdateAppointment {
        id: AppointmentId,
        update: AppointmentUpdate,
    },
    SetStatus {
        id: AppointmentId,
        status: AppointmentStatus,
    },
    DeleteAppointment {
        id: AppointmentId,
    },
    SelectAppointment {
        id: AppointmentId,
    },
    SelectAppointments {
        day: Option<NaiveDateTime>,
    },
    SelectTerminals,
}

/// Column order for positional `INSERT INTO appointments VALUES (...)`.
const INSERT_COLUMNS: [&str; 9] = [
    "company_id",
    "terminal_id",
    "driver_id",
    "container_number",
    "move_type",
    "size_type",
    "line",
    "chassis_no",
    "created",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported(format!(
            "{} statements in one query, expected one",
            stmts.len()
        )));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;
    if values.len() != INSERT_COLUMNS.len() {
        return Err(SqlError::WrongArity("appointments", INSERT_COLUMNS.len(), values.len()));
    }

    let named: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let value = |col| column_value(&values, &named, col);

    Ok(Command::InsertAppointment(NewAppointment {
        company_id: CompanyId(parse_u32(value("company_id")?)?),
        terminal_id: TerminalId(parse_u32(value("terminal_id")?)?),
        driver_id: DriverId(parse_u32(value("driver_id")?)?),
        container_number: parse_string(value("container_number")?)?,
        move_type: parse_string(value("move_type")?)?,
        size_type: parse_string(value("size_type")?)?,
        line: parse_string(value("line")?)?,
        chassis_no: parse_string(value("chassis_no")?)?,
        created: parse_timestamp(value("created")?)?,
    }))
}

/// Positional unless the INSERT named its columns, in which case by name.
fn column_value<'a>(
    values: &'a [Expr],
    named: &[String],
    col: &'static str,
) -> Result<&'a Expr, SqlError> {
    let idx = if named.is_empty() {
        INSERT_COLUMNS.iter().position(|c| *c == col)
    } else {
        named.iter().position(|c| c == col)
    };
    idx.and_then(|i| values.get(i)).ok_or(SqlError::MissingValue(col))
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let (mut status, mut move_type, mut created) = (None, None, None);
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;

        match col.as_str() {
            "status" => status = Some(parse_status(&assignment.value)?),
            "move_type" => move_type = Some(parse_string(&assignment.value)?),
            "created" => created = Some(parse_timestamp(&assignment.value)?),
            other => return Err(SqlError::Unsupported(format!("cannot set column {other}"))),
        }
    }

    match (status, move_type, created) {
        (Some(status), None, None) => Ok(Command::SetStatus { id, status }),
        (Some(_), _, _) => Err(SqlError::Unsupported(
            "status cannot be changed together with other columns".into(),
        )),
        (None, Some(move_type), Some(created)) => Ok(Command::UpdateAppointment {
            id,
            update: AppointmentUpdate { move_type, created },
        }),
        (None, None, _) => Err(SqlError::MissingValue("move_type")),
        (None, Some(_), None) => Err(SqlError::MissingValue("created")),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteAppointment { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "terminals" => Ok(Command::SelectTerminals),
        "appointments" => {
            let Some(selection) = &select.selection else {
                return Ok(Command::SelectAppointments { day: None });
            };
            let (col, value) = equality_filter(selection)?;
            match col.as_str() {
                "id" => Ok(Command::SelectAppointment { id: AppointmentId(parse_u64(value)?) }),
                "day" => Ok(Command::SelectAppointments { day: Some(parse_day(value)?) }),
                other => Err(SqlError::Unsupported(format!("filter on {other}"))),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `column = value`, the only filter shape accepted.
fn equality_filter(expr: &Expr) -> Result<(String, &Expr), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => expr_column_name(left)
            .map(|col| (col, right.as_ref()))
            .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}"))),
        Expr::Nested(inner) => equality_filter(inner),
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<AppointmentId, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match equality_filter(sel) {
        Ok((col, value)) if col == "id" => Ok(AppointmentId(parse_u64(value)?)),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad id {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_u64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    let s = parse_string(expr)?;
    match s.to_lowercase().as_str() {
        "approved" => Ok(AppointmentStatus::Approved),
        "canceled" | "cancelled" => Ok(AppointmentStatus::Canceled),
        _ => Err(SqlError::Parse(format!("status must be 'approved' or 'canceled', got {s}"))),
    }
}

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub fn parse_timestamp_str(s: &str) -> Result<NaiveDateTime, SqlError> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
}

fn parse_timestamp(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    parse_timestamp_str(&parse_string(expr)?)
}

/// A full timestamp or a bare date; a bare date means midnight.
fn parse_day(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_string(expr)?;
    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    parse_timestamp_str(&s)
}

/// Render a timestamp the way the parser reads it back.
/// ISO-8601 text; fractional seconds appear only when non-zero.
pub fn format_timestamp(at: &NaiveDateTime) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value for column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT: &str = "INSERT INTO appointments VALUES \
        (1, 7, 1, 'MSCU1234567', 'Import', '40HC', 'MSC', 'CH-1', '2024-03-10T08:00:00')";

    #[test]
    fn parse_insert_appointment() {
        let cmd = parse_sql(INSERT).unwrap();
        match cmd {
            Command::InsertAppointment(req) => {
                assert_eq!(req.company_id, CompanyId(1));
                assert_eq!(req.terminal_id, TerminalId(7));
                assert_eq!(req.driver_id, DriverId(1));
                assert_eq!(req.container_number, "MSCU1234567");
                assert_eq!(req.move_type, "Import");
                assert_eq!(req.size_type, "40HC");
                assert_eq!(req.line, "MSC");
                assert_eq!(req.chassis_no, "CH-1");
                assert_eq!(req.created, ts("2024-03-10T08:00:00"));
            }
            _ => panic!("expected InsertAppointment, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_with_named_columns_in_any_order() {
        let sql = "INSERT INTO appointments \
            (created, container_number, company_id, terminal_id, driver_id, move_type, size_type, line, chassis_no) \
            VALUES ('2024-03-10 08:00:00', 'MSCU1234567', 1, 7, 1, 'Import', '40HC', 'MSC', 'CH-1')";
        assert_eq!(parse_sql(sql).unwrap(), parse_sql(INSERT).unwrap());
    }

    #[test]
    fn parse_insert_wrong_arity() {
        let sql = "INSERT INTO appointments VALUES (1, 7, 1, 'MSCU1234567')";
        assert!(matches!(parse_sql(sql), Err(SqlError::WrongArity("appointments", 9, 4))));
    }

    #[test]
    fn parse_insert_rejects_bad_timestamp() {
        let sql = "INSERT INTO appointments VALUES \
            (1, 7, 1, 'C', 'Import', '40HC', 'MSC', 'CH-1', '10/03/2024')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_update_fields() {
        let sql = "UPDATE appointments SET move_type = 'Export', created = '2024-03-15T14:30:00' WHERE id = 3";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::UpdateAppointment {
                id: AppointmentId(3),
                update: AppointmentUpdate {
                    move_type: "Export".into(),
                    created: ts("2024-03-15T14:30:00"),
                },
            }
        );
    }

    #[test]
    fn parse_update_requires_both_fields() {
        let sql = "UPDATE appointments SET move_type = 'Export' WHERE id = 3";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingValue("created"))));
    }

    #[test]
    fn parse_status_changes() {
        assert_eq!(
            parse_sql("UPDATE appointments SET status = 'approved' WHERE id = 5").unwrap(),
            Command::SetStatus { id: AppointmentId(5), status: AppointmentStatus::Approved }
        );
        assert_eq!(
            parse_sql("UPDATE appointments SET status = 'CANCELED' WHERE id = 5").unwrap(),
            Command::SetStatus { id: AppointmentId(5), status: AppointmentStatus::Canceled }
        );
        assert!(parse_sql("UPDATE appointments SET status = 'scheduled' WHERE id = 5").is_err());
    }

    #[test]
    fn parse_update_without_id_errors() {
        let sql = "UPDATE appointments SET status = 'approved'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_delete_appointment() {
        assert_eq!(
            parse_sql("DELETE FROM appointments WHERE id = 12").unwrap(),
            Command::DeleteAppointment { id: AppointmentId(12) }
        );
    }

    #[test]
    fn parse_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM appointments").unwrap(),
            Command::SelectAppointments { day: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM appointments WHERE id = 4").unwrap(),
            Command::SelectAppointment { id: AppointmentId(4) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM appointments WHERE day = '2024-03-10'").unwrap(),
            Command::SelectAppointments { day: Some(ts("2024-03-10T00:00:00")) }
        );
        assert_eq!(
            parse_sql("SELECT * FROM appointments WHERE day = '2024-03-10T17:45:00'").unwrap(),
            Command::SelectAppointments { day: Some(ts("2024-03-10T17:45:00")) }
        );
        assert_eq!(parse_sql("SELECT * FROM terminals").unwrap(), Command::SelectTerminals);
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(parse_timestamp_str("2024-03-10T08:00:00").unwrap(), ts("2024-03-10T08:00:00"));
        assert_eq!(parse_timestamp_str("2024-03-10 08:00:00").unwrap(), ts("2024-03-10T08:00:00"));
        assert!(parse_timestamp_str("2024-03-10T08:00:00.250").is_ok());
        assert!(parse_timestamp_str("2024-13-10T08:00:00").is_err());
        assert_eq!(format_timestamp(&ts("2024-03-10T08:00:00")), "2024-03-10T08:00:00");
    }

    #[test]
    fn fractional_seconds_survive_read_back() {
        let at = parse_timestamp_str("2024-03-10 08:00:00.250").unwrap();
        assert_eq!(format_timestamp(&at), "2024-03-10T08:00:00.250");
        assert_eq!(parse_timestamp_str(&format_timestamp(&at)).unwrap(), at);
    }

    #[test]
    fn multiple_statements_rejected() {
        assert!(matches!(
            parse_sql("DELETE FROM appointments WHERE id = 1; DELETE FROM appointments WHERE id = 2"),
            Err(SqlError::Unsupported(_))
        ));
        // a trailing semicolon is still one statement
        assert_eq!(
            parse_sql("DELETE FROM appointments WHERE id = 1;").unwrap(),
            Command::DeleteAppointment { id: AppointmentId(1) }
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(parse_sql("SELECT * FROM bookings"), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("DELETE FROM terminals WHERE id = 1"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(parse_sql("").is_err());
    }
}

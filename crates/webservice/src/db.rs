use levseq_protocol::{ResultSet, Scalar, Verb};
use sqlx::postgres::PgRow;
use sqlx::{Column, Connection, Executor, PgConnection, Row, Statement, TypeInfo};

#[derive(Debug)]
pub enum GatewayError {
    Database(sqlx::Error),
    UnsupportedColumn { column: String, type_name: String },
    Shape(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Surface the server-side message verbatim when there is one.
            GatewayError::Database(err) => match err.as_database_error() {
                Some(db_err) => write!(f, "{}", db_err.message()),
                None => write!(f, "{}", err),
            },
            GatewayError::UnsupportedColumn { column, type_name } => {
                write!(f, "unsupported column type {} for column {}", type_name, column)
            }
            GatewayError::Shape(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<sqlx::Error> for GatewayError {
    fn from(value: sqlx::Error) -> Self {
        GatewayError::Database(value)
    }
}

// One stored-function call per invocation, on a fresh connection that is
// closed on every exit path. No pooling.
#[derive(Clone)]
pub struct PgGateway {
    conninfo: String,
    schema: String,
}

impl PgGateway {
    pub fn new(conninfo: String, schema: String) -> Self {
        Self { conninfo, schema }
    }

    pub async fn fetch(&self, verb: &Verb, args: &[Scalar]) -> Result<ResultSet, GatewayError> {
        let mut conn = PgConnection::connect(&self.conninfo).await?;
        let result = fetch_on(&mut conn, &self.schema, verb, args).await;
        let _ = conn.close().await;
        result
    }

    pub async fn non_query(&self, verb: &Verb, args: &[Scalar]) -> Result<(), GatewayError> {
        let mut conn = PgConnection::connect(&self.conninfo).await?;
        let result = execute_on(&mut conn, &self.schema, verb, args).await;
        let _ = conn.close().await;
        result
    }

    pub async fn query_scalar(&self, verb: &Verb, args: &[Scalar]) -> Result<Scalar, GatewayError> {
        let table = self.fetch(verb, args).await?;
        scalar_from_table(table)
    }
}

async fn fetch_on(
    conn: &mut PgConnection,
    schema: &str,
    verb: &Verb,
    args: &[Scalar],
) -> Result<ResultSet, GatewayError> {
    let sql = compose_call(schema, verb, args.len());

    // Preparing first yields the result descriptor even for empty rowsets.
    let stmt = (&mut *conn).prepare(sql.as_str()).await?;
    let columns = stmt
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>();

    let mut query = stmt.query();
    for arg in args {
        query = match arg {
            Scalar::Int(v) => query.bind(*v),
            Scalar::Float(v) => query.bind(*v),
            Scalar::Text(v) => query.bind(v.clone()),
        };
    }

    let pg_rows = query.fetch_all(&mut *conn).await?;
    let mut rows = Vec::with_capacity(pg_rows.len());
    for row in &pg_rows {
        rows.push(decode_row(row)?);
    }

    Ok(ResultSet { columns, rows })
}

async fn execute_on(
    conn: &mut PgConnection,
    schema: &str,
    verb: &Verb,
    args: &[Scalar],
) -> Result<(), GatewayError> {
    let sql = compose_call(schema, verb, args.len());

    let mut query = sqlx::query(sql.as_str());
    for arg in args {
        query = match arg {
            Scalar::Int(v) => query.bind(*v),
            Scalar::Float(v) => query.bind(*v),
            Scalar::Text(v) => query.bind(v.clone()),
        };
    }

    query.execute(&mut *conn).await?;
    Ok(())
}

fn scalar_from_table(table: ResultSet) -> Result<Scalar, GatewayError> {
    if table.rows.len() != 1 || table.columns.len() != 1 {
        return Err(GatewayError::Shape(format!(
            "scalar query returned {} row(s) with {} column(s)",
            table.rows.len(),
            table.columns.len()
        )));
    }

    table
        .rows
        .into_iter()
        .next()
        .and_then(|mut row| row.pop())
        .flatten()
        .ok_or_else(|| GatewayError::Shape("scalar query returned NULL".to_string()))
}

fn decode_row(row: &PgRow) -> Result<Vec<Option<Scalar>>, GatewayError> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &PgRow, idx: usize) -> Result<Option<Scalar>, GatewayError> {
    let column = &row.columns()[idx];

    match column.type_info().name() {
        "INT2" => Ok(row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Scalar::Int(i64::from(v)))),
        "INT4" => Ok(row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Scalar::Int(i64::from(v)))),
        "INT8" => Ok(row.try_get::<Option<i64>, _>(idx)?.map(Scalar::Int)),
        "FLOAT4" => Ok(row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Scalar::Float(f64::from(v)))),
        "FLOAT8" => Ok(row.try_get::<Option<f64>, _>(idx)?.map(Scalar::Float)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => Ok(row
            .try_get::<Option<String>, _>(idx)?
            .map(Scalar::Text)),
        other => Err(GatewayError::UnsupportedColumn {
            column: column.name().to_string(),
            type_name: other.to_string(),
        }),
    }
}

// The verb and schema are inserted as quoted identifiers; parameter values
// only ever travel through driver-side binds.
pub fn compose_call(schema: &str, verb: &Verb, arg_count: usize) -> String {
    let mut placeholders = String::new();
    for i in 1..=arg_count {
        if i > 1 {
            placeholders.push_str(", ");
        }
        placeholders.push('$');
        placeholders.push_str(&i.to_string());
    }

    format!(
        "SELECT * FROM {}.{}({})",
        quote_ident(schema),
        quote_ident(&verb.to_string()),
        placeholders
    )
}

fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_call_without_args_has_empty_parens() {
        let verb = Verb::parse("get_usernames").expect("verb");
        assert_eq!(
            compose_call("levseq", &verb, 0),
            "SELECT * FROM \"levseq\".\"get_usernames\"()"
        );
    }

    #[test]
    fn compose_call_numbers_placeholders_positionally() {
        let verb = Verb::parse("save_user_ip").expect("verb");
        assert_eq!(
            compose_call("levseq", &verb, 2),
            "SELECT * FROM \"levseq\".\"save_user_ip\"($1, $2)"
        );
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("sch\"ema"), "\"sch\"\"ema\"");
    }

    #[test]
    fn scalar_from_table_accepts_one_by_one() {
        let table = ResultSet {
            columns: vec!["count".to_string()],
            rows: vec![vec![Some(Scalar::Int(42))]],
        };
        assert_eq!(scalar_from_table(table).expect("scalar"), Scalar::Int(42));
    }

    #[test]
    fn scalar_from_table_rejects_wrong_shapes() {
        let empty = ResultSet {
            columns: vec!["count".to_string()],
            rows: Vec::new(),
        };
        let err = scalar_from_table(empty).expect_err("empty must fail");
        assert_eq!(
            err.to_string(),
            "scalar query returned 0 row(s) with 1 column(s)"
        );

        let wide = ResultSet {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![Some(Scalar::Int(1)), Some(Scalar::Int(2))]],
        };
        let err = scalar_from_table(wide).expect_err("wide must fail");
        assert_eq!(
            err.to_string(),
            "scalar query returned 1 row(s) with 2 column(s)"
        );
    }

    #[test]
    fn scalar_from_table_rejects_null() {
        let table = ResultSet {
            columns: vec!["count".to_string()],
            rows: vec![vec![None]],
        };
        let err = scalar_from_table(table).expect_err("null must fail");
        assert_eq!(err.to_string(), "scalar query returned NULL");
    }
}

//! The fixed catalog of data operations the model may call.
//!
//! Each descriptor's parameter list is the single source of truth: it is
//! rendered into the JSON tool schema sent to the model, and the same list is
//! used to re-check whatever arguments the model sends back before anything
//! touches the backend.

use serde_json::{json, Map, Value};

pub const DEFAULT_SELECT_LIMIT: usize = 50;
pub const MAX_SELECT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Object,
    /// Any JSON scalar; compared by its text form.
    Scalar,
}

impl ParamType {
    fn json_schema_type(self) -> Value {
        match self {
            ParamType::String => json!("string"),
            ParamType::Integer => json!("integer"),
            ParamType::Object => json!("object"),
            ParamType::Scalar => json!(["string", "number", "boolean"]),
        }
    }

    fn expected(self) -> &'static str {
        match self {
            ParamType::String => "a string",
            ParamType::Integer => "a non-negative integer",
            ParamType::Object => "a JSON object",
            ParamType::Scalar => "a string, number or boolean",
        }
    }

    fn accepts(self, v: &Value) -> bool {
        match self {
            ParamType::String => v.is_string(),
            ParamType::Integer => as_non_negative_integer(v).is_some(),
            ParamType::Object => v.is_object(),
            ParamType::Scalar => v.is_string() || v.is_number() || v.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
}

const fn required(name: &'static str, ty: ParamType, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required: true,
        description,
    }
}

const fn optional(name: &'static str, ty: ParamType, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required: false,
        description,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    ListTables,
    DescribeTable,
    SelectData,
    InsertData,
    UpdateData,
    DeleteData,
    ExecuteSql,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::ListTables => "list_tables",
            OperationKind::DescribeTable => "describe_table",
            OperationKind::SelectData => "select_data",
            OperationKind::InsertData => "insert_data",
            OperationKind::UpdateData => "update_data",
            OperationKind::DeleteData => "delete_data",
            OperationKind::ExecuteSql => "execute_sql",
        }
    }
}

#[derive(Debug)]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

impl OperationDescriptor {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in self.params {
            properties.insert(
                p.name.to_string(),
                json!({ "type": p.ty.json_schema_type(), "description": p.description }),
            );
            if p.required {
                required.push(json!(p.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// The descriptor in chat-completions `tools` form.
    pub fn to_tool_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description,
                "parameters": self.parameters_schema(),
            }
        })
    }
}

const TABLE_NAME: ParamSpec = required("table_name", ParamType::String, "Name of the table");

static CATALOG: [OperationDescriptor; 7] = [
    OperationDescriptor {
        kind: OperationKind::ListTables,
        description: "List every table that can be queried in the connected database.",
        params: &[],
    },
    OperationDescriptor {
        kind: OperationKind::DescribeTable,
        description: "Describe a table: its columns and their types, inferred from a few sample rows.",
        params: &[TABLE_NAME],
    },
    OperationDescriptor {
        kind: OperationKind::SelectData,
        description: "Read rows from a table, optionally filtered by a single column equality.",
        params: &[
            TABLE_NAME,
            optional(
                "columns",
                ParamType::String,
                "Comma-separated columns to return (default: all columns)",
            ),
            optional("filter_column", ParamType::String, "Column to filter on (optional)"),
            optional("filter_value", ParamType::Scalar, "Value the filter column must equal (optional)"),
            optional("limit", ParamType::Integer, "Maximum number of rows (default 50)"),
        ],
    },
    OperationDescriptor {
        kind: OperationKind::InsertData,
        description: "Insert one new row into a table.",
        params: &[
            TABLE_NAME,
            required("data", ParamType::Object, "The row to insert, as a JSON object"),
        ],
    },
    OperationDescriptor {
        kind: OperationKind::UpdateData,
        description: "Update the rows of a table whose filter column equals the filter value.",
        params: &[
            TABLE_NAME,
            required("filter_column", ParamType::String, "Column that selects the rows (e.g. id)"),
            required("filter_value", ParamType::Scalar, "Value the filter column must equal"),
            required("data", ParamType::Object, "New column values"),
        ],
    },
    OperationDescriptor {
        kind: OperationKind::DeleteData,
        description: "Delete the rows of a table whose filter column equals the filter value.",
        params: &[
            TABLE_NAME,
            required("filter_column", ParamType::String, "Column that selects the rows"),
            required("filter_value", ParamType::Scalar, "Value the filter column must equal"),
        ],
    },
    OperationDescriptor {
        kind: OperationKind::ExecuteSql,
        description: "Execute arbitrary SQL for advanced operations such as CREATE TABLE, ALTER, DROP or complex queries. Best effort.",
        params: &[
            required("sql", ParamType::String, "The SQL to execute"),
            optional("description", ParamType::String, "Short description of the operation"),
        ],
    },
];

pub fn catalog() -> &'static [OperationDescriptor] {
    &CATALOG
}

pub fn lookup(name: &str) -> Option<&'static OperationDescriptor> {
    CATALOG.iter().find(|d| d.name() == name)
}

/// The whole catalog in chat-completions `tools` form.
pub fn tools_json() -> Vec<Value> {
    CATALOG.iter().map(OperationDescriptor::to_tool_json).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqFilter {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectArgs {
    pub table_name: String,
    /// `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub filter: Option<EqFilter>,
    pub limit: usize,
}

impl SelectArgs {
    pub fn all(table_name: impl Into<String>, limit: usize) -> Self {
        Self {
            table_name: table_name.into(),
            columns: None,
            filter: None,
            limit,
        }
    }
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum DataOperation {
    ListTables,
    DescribeTable {
        table_name: String,
    },
    SelectData(SelectArgs),
    InsertData {
        table_name: String,
        data: Map<String, Value>,
    },
    UpdateData {
        table_name: String,
        filter: EqFilter,
        data: Map<String, Value>,
    },
    DeleteData {
        table_name: String,
        filter: EqFilter,
    },
    ExecuteSql {
        sql: String,
        description: Option<String>,
    },
}

impl DataOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            DataOperation::ListTables => OperationKind::ListTables,
            DataOperation::DescribeTable { .. } => OperationKind::DescribeTable,
            DataOperation::SelectData(_) => OperationKind::SelectData,
            DataOperation::InsertData { .. } => OperationKind::InsertData,
            DataOperation::UpdateData { .. } => OperationKind::UpdateData,
            DataOperation::DeleteData { .. } => OperationKind::DeleteData,
            DataOperation::ExecuteSql { .. } => OperationKind::ExecuteSql,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("unknown tool `{0}`")]
    UnknownOperation(String),
    #[error("arguments are not valid JSON: {0}")]
    MalformedJson(String),
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required argument `{0}`")]
    Missing(&'static str),
    #[error("argument `{name}` must be {expected}")]
    WrongType {
        name: &'static str,
        expected: &'static str,
    },
    #[error("`{name}` is not a valid identifier: {value:?}")]
    BadIdentifier { name: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Validate a raw model invocation (name + JSON argument text).
pub fn validate_call(name: &str, arguments: &str) -> Result<DataOperation, ArgumentError> {
    let descriptor = lookup(name).ok_or_else(|| ArgumentError::UnknownOperation(name.to_string()))?;
    let raw = arguments.trim();
    let args: Value = if raw.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(raw).map_err(|e| ArgumentError::MalformedJson(e.to_string()))?
    };
    validate(descriptor, &args)
}

/// Check `args` against the descriptor's parameters and build the typed operation.
pub fn validate(
    descriptor: &OperationDescriptor,
    args: &Value,
) -> Result<DataOperation, ArgumentError> {
    let obj = match args {
        Value::Object(obj) => obj,
        Value::Null => return validate(descriptor, &Value::Object(Map::new())),
        _ => return Err(ArgumentError::NotAnObject),
    };

    for p in descriptor.params {
        match obj.get(p.name) {
            None | Some(Value::Null) => {
                if p.required {
                    return Err(ArgumentError::Missing(p.name));
                }
            }
            Some(v) => {
                if !p.ty.accepts(v) {
                    return Err(ArgumentError::WrongType {
                        name: p.name,
                        expected: p.ty.expected(),
                    });
                }
            }
        }
    }

    let args = Args(obj);
    Ok(match descriptor.kind {
        OperationKind::ListTables => DataOperation::ListTables,
        OperationKind::DescribeTable => DataOperation::DescribeTable {
            table_name: args.identifier("table_name")?,
        },
        OperationKind::SelectData => {
            let filter = match (args.opt_str("filter_column"), args.opt_scalar("filter_value")) {
                (Some(column), Some(value)) => Some(EqFilter {
                    column: check_identifier("filter_column", column)?,
                    value,
                }),
                (None, None) => None,
                _ => {
                    return Err(ArgumentError::Invalid(
                        "`filter_column` and `filter_value` must be given together".to_string(),
                    ))
                }
            };
            let limit = match args.opt_integer("limit") {
                None | Some(0) => DEFAULT_SELECT_LIMIT,
                Some(n) => usize::try_from(n).unwrap_or(MAX_SELECT_LIMIT).min(MAX_SELECT_LIMIT),
            };
            DataOperation::SelectData(SelectArgs {
                table_name: args.identifier("table_name")?,
                columns: args
                    .opt_str("columns")
                    .map(|c| parse_column_list(&c))
                    .transpose()?
                    .flatten(),
                filter,
                limit,
            })
        }
        OperationKind::InsertData => DataOperation::InsertData {
            table_name: args.identifier("table_name")?,
            data: args.object("data")?,
        },
        OperationKind::UpdateData => {
            let data = args.object("data")?;
            if data.is_empty() {
                return Err(ArgumentError::Invalid(
                    "`data` must contain at least one column to update".to_string(),
                ));
            }
            DataOperation::UpdateData {
                table_name: args.identifier("table_name")?,
                filter: args.filter()?,
                data,
            }
        }
        OperationKind::DeleteData => DataOperation::DeleteData {
            table_name: args.identifier("table_name")?,
            filter: args.filter()?,
        },
        OperationKind::ExecuteSql => {
            let sql = args.opt_str("sql").unwrap_or_default();
            if sql.trim().is_empty() {
                return Err(ArgumentError::Invalid("`sql` must not be empty".to_string()));
            }
            DataOperation::ExecuteSql {
                sql,
                description: args.opt_str("description"),
            }
        }
    })
}

struct Args<'a>(&'a Map<String, Value>);

impl Args<'_> {
    fn opt_str(&self, name: &str) -> Option<String> {
        self.0.get(name).and_then(Value::as_str).map(|s| s.to_string())
    }

    fn opt_scalar(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn opt_integer(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(as_non_negative_integer)
    }

    fn identifier(&self, name: &'static str) -> Result<String, ArgumentError> {
        let v = self.opt_str(name).ok_or(ArgumentError::Missing(name))?;
        check_identifier(name, v)
    }

    fn object(&self, name: &'static str) -> Result<Map<String, Value>, ArgumentError> {
        let obj = self
            .0
            .get(name)
            .and_then(Value::as_object)
            .cloned()
            .ok_or(ArgumentError::Missing(name))?;
        for key in obj.keys() {
            check_identifier(name, key.clone())?;
        }
        Ok(obj)
    }

    fn filter(&self) -> Result<EqFilter, ArgumentError> {
        Ok(EqFilter {
            column: self.identifier("filter_column")?,
            value: self
                .opt_scalar("filter_value")
                .ok_or(ArgumentError::Missing("filter_value"))?,
        })
    }
}

fn as_non_negative_integer(v: &Value) -> Option<u64> {
    if let Some(n) = v.as_u64() {
        return Some(n);
    }
    let f = v.as_f64()?;
    if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(name: &'static str, value: String) -> Result<String, ArgumentError> {
    let trimmed = value.trim();
    if is_identifier(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(ArgumentError::BadIdentifier { name, value })
    }
}

/// `"*"` (or blank) means every column; otherwise a comma-separated identifier list.
fn parse_column_list(raw: &str) -> Result<Option<Vec<String>>, ArgumentError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        return Ok(None);
    }
    raw.split(',')
        .map(|c| check_identifier("columns", c.trim().to_string()))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

use serde::{Deserialize, Serialize};

// Variant order matters: serde tries Int before Float, so JSON integers
// that fit i64 stay integers and everything else numeric becomes Float.
// Booleans, nulls, arrays and objects match no variant and are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Text(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidVerb(pub String);

impl std::fmt::Display for InvalidVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid query '{}'", self.0)
    }
}

impl std::error::Error for InvalidVerb {}

// The verb variant is fixed at parse time; downstream code matches on it
// instead of re-inspecting the prefix string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Verb {
    Get(String),
    Do(String),
    Save(String),
    Is(String),
    Peek(String),
    Load(String),
    Unload(String),
}

impl Verb {
    pub fn parse(raw: &str) -> Result<Self, InvalidVerb> {
        let invalid = || InvalidVerb(raw.to_string());

        let (prefix, suffix) = raw.split_once('_').ok_or_else(invalid)?;
        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(invalid());
        }
        if suffix.is_empty()
            || !suffix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(invalid());
        }

        let suffix = suffix.to_string();
        match prefix {
            "get" => Ok(Verb::Get(suffix)),
            "do" => Ok(Verb::Do(suffix)),
            "save" => Ok(Verb::Save(suffix)),
            "is" => Ok(Verb::Is(suffix)),
            "peek" => Ok(Verb::Peek(suffix)),
            "load" => Ok(Verb::Load(suffix)),
            "unload" => Ok(Verb::Unload(suffix)),
            _ => Err(invalid()),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Verb::Get(_) => "get",
            Verb::Do(_) => "do",
            Verb::Save(_) => "save",
            Verb::Is(_) => "is",
            Verb::Peek(_) => "peek",
            Verb::Load(_) => "load",
            Verb::Unload(_) => "unload",
        }
    }

    pub fn suffix(&self) -> &str {
        match self {
            Verb::Get(s)
            | Verb::Do(s)
            | Verb::Save(s)
            | Verb::Is(s)
            | Verb::Peek(s)
            | Verb::Load(s)
            | Verb::Unload(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.prefix(), self.suffix())
    }
}

impl std::str::FromStr for Verb {
    type Err = InvalidVerb;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Verb::parse(raw)
    }
}

impl TryFrom<String> for Verb {
    type Error = InvalidVerb;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Verb::parse(&raw)
    }
}

impl From<Verb> for String {
    fn from(verb: Verb) -> String {
        verb.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidParams;

impl std::fmt::Display for InvalidParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query parameters are not list[Scalar]")
    }
}

impl std::error::Error for InvalidParams {}

pub fn params_from_json(value: &serde_json::Value) -> Result<Vec<Scalar>, InvalidParams> {
    let serde_json::Value::Array(items) = value else {
        return Err(InvalidParams);
    };
    items.iter().map(scalar_from_json).collect()
}

fn scalar_from_json(value: &serde_json::Value) -> Result<Scalar, InvalidParams> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Scalar::Int)
            .or_else(|| n.as_f64().map(Scalar::Float))
            .ok_or(InvalidParams),
        serde_json::Value::String(s) => Ok(Scalar::Text(s.clone())),
        _ => Err(InvalidParams),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub verb: Verb,
    pub params: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Scalar>>>,
}

impl ResultSet {
    pub fn validate(&self) -> Result<(), &'static str> {
        for row in &self.rows {
            if row.len() != self.columns.len() {
                return Err("row length does not match column count");
            }
        }
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarResponse {
    pub details: Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

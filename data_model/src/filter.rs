use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use anyhow::Result;
use serde::{de::Deserializer, Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
}

impl Operator {
    pub fn from_str(operator: &str) -> Result<Self> {
        match operator {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Neq),
            _ => Err(anyhow::anyhow!("Invalid filter operator: {}", operator)),
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Operator::Eq => "==",
                Operator::Neq => "!=",
            }
        )
    }
}

/// One `label==value` / `label!=value` clause of a container filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub key: String,
    pub value: String,
    pub operator: Operator,
}

impl Serialize for Expression {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format!("{self}").serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D>(deserializer: D) -> Result<Expression, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Expression::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Expression {
    pub fn from_str(str: &str) -> Result<Self> {
        // Longest operators first so "!=" is not split as "=".
        let operators = ["!=", "=="];
        for operator in operators {
            let parts: Vec<&str> = str.split(operator).collect();
            if parts.len() != 2 {
                continue;
            }
            return Ok(Self {
                key: parts[0].trim().to_string(),
                value: parts[1].trim().to_string(),
                operator: Operator::from_str(operator)?,
            });
        }
        Err(anyhow::anyhow!("Invalid filter expression: {}", str))
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match self.operator {
            Operator::Eq => actual.map(|v| v == &self.value).unwrap_or(false),
            Operator::Neq => actual.map(|v| v != &self.value).unwrap_or(true),
        }
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, self.operator, self.value)
    }
}

/// A conjunction of label clauses parsed from a job's filter string, e.g.
/// `tier==web,env!=staging`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelsFilter(pub Vec<Expression>);

impl LabelsFilter {
    pub fn parse(input: &str) -> Result<Self> {
        let expressions = input
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Expression::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(expressions))
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.0.iter().all(|e| e.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use net::ip::Cidr;
use regex::Regex;

use crate::ast::Type;

/// A runtime value. Arrays are immutable once constructed and shared by
/// reference; everything else is small enough to clone.
#[derive(Clone, Debug)]
pub enum Value {
    Void,
    Bool(bool),
    Number(i64),
    String(String),
    IP(IpAddr),
    Cidr(Cidr),
    RegExp(Regex),
    IntArray(Arc<Vec<i64>>),
    StringArray(Arc<Vec<String>>),
    IPArray(Arc<Vec<IpAddr>>),
    CidrArray(Arc<Vec<Cidr>>),
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Void => Type::Void,
            Value::Bool(_) => Type::Bool,
            Value::Number(_) => Type::Number,
            Value::String(_) => Type::String,
            Value::IP(_) => Type::IPAddress,
            Value::Cidr(_) => Type::Cidr,
            Value::RegExp(_) => Type::RegExp,
            Value::IntArray(_) => Type::IntArray,
            Value::StringArray(_) => Type::StringArray,
            Value::IPArray(_) => Type::IPArray,
            Value::CidrArray(_) => Type::CidrArray,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(value) => *value,
            Value::Number(value) => *value != 0,
            _ => false,
        }
    }

    pub fn as_number(&self) -> i64 {
        match self {
            Value::Number(value) => *value,
            Value::Bool(true) => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::String(value) => value,
            _ => "",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::IP(a), Value::IP(b)) => a == b,
            (Value::Cidr(a), Value::Cidr(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a.as_str() == b.as_str(),
            (Value::IntArray(a), Value::IntArray(b)) => a == b,
            (Value::StringArray(a), Value::StringArray(b)) => a == b,
            (Value::IPArray(a), Value::IPArray(b)) => a == b,
            (Value::CidrArray(a), Value::CidrArray(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Void => write!(f, "(void)"),
            Value::Bool(value) => write!(f, "{}", value),
            Value::Number(value) => write!(f, "{}", value),
            Value::String(value) => write!(f, "{}", value),
            Value::IP(addr) => write!(f, "{}", addr),
            Value::Cidr(cidr) => write!(f, "{}", cidr),
            Value::RegExp(re) => write!(f, "/{}/", re.as_str()),
            Value::IntArray(values) => write!(f, "{:?}", values),
            Value::StringArray(values) => write!(f, "{:?}", values),
            Value::IPArray(values) => write!(f, "{:?}", values),
            Value::CidrArray(values) => {
                write!(f, "[")?;
                for (i, cidr) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", cidr)?;
                }
                write!(f, "]")
            }
        }
    }
}

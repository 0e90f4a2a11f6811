//! Parameter signatures and argument binding

use crate::types::{Args, Map, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Positional,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

impl Param {
    fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            annotation: None,
        }
    }

    pub fn positional(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Positional)
    }

    pub fn var_positional(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::VarPositional)
    }

    pub fn keyword_only(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::KeywordOnly)
    }

    pub fn var_keyword(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::VarKeyword)
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn annotated(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// How a function body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Convention {
    Sync,
    Async,
    Stream,
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "synchronous"),
            Self::Async => write!(f, "asynchronous"),
            Self::Stream => write!(f, "asynchronous stream"),
        }
    }
}

/// Ordered parameter list of a plugin function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(*args, **kwargs)`: accepts any call.
    pub fn variadic() -> Self {
        Self::new()
            .param(Param::var_positional("args"))
            .param(Param::var_keyword("kwargs"))
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Names of the positional parameters, in order.
    pub fn positional_names(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|p| p.kind == ParamKind::Positional)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn var_positional_index(&self) -> Option<usize> {
        self.params.iter().position(|p| p.kind == ParamKind::VarPositional)
    }

    pub fn has_var_positional(&self) -> bool {
        self.var_positional_index().is_some()
    }

    pub fn has_var_keyword(&self) -> bool {
        self.params.iter().any(|p| p.kind == ParamKind::VarKeyword)
    }

    /// Bind call arguments to parameter names.
    ///
    /// Var-positional values bind as an array, var-keyword values as an object.
    pub fn bind(&self, args: &Args) -> std::result::Result<Map, String> {
        let mut bound = Map::new();
        let mut keywords = args.keywords.clone();
        let mut positional = args.positional.iter();

        for param in &self.params {
            match param.kind {
                ParamKind::Positional => {
                    if let Some(value) = positional.next() {
                        if keywords.contains_key(&param.name) {
                            return Err(format!("multiple values for argument '{}'", param.name));
                        }
                        bound.insert(param.name.clone(), value.clone());
                    } else if let Some(value) = keywords.remove(&param.name) {
                        bound.insert(param.name.clone(), value);
                    } else if let Some(default) = &param.default {
                        bound.insert(param.name.clone(), default.clone());
                    } else {
                        return Err(format!("missing a required argument: '{}'", param.name));
                    }
                }
                ParamKind::VarPositional => {
                    let rest: Vec<Value> = positional.by_ref().cloned().collect();
                    bound.insert(param.name.clone(), Value::Array(rest));
                }
                ParamKind::KeywordOnly => {
                    if let Some(value) = keywords.remove(&param.name) {
                        bound.insert(param.name.clone(), value);
                    } else if let Some(default) = &param.default {
                        bound.insert(param.name.clone(), default.clone());
                    } else {
                        return Err(format!(
                            "missing a required keyword-only argument: '{}'",
                            param.name
                        ));
                    }
                }
                ParamKind::VarKeyword => {
                    bound.insert(param.name.clone(), Value::Object(std::mem::take(&mut keywords)));
                }
            }
        }

        if positional.next().is_some() {
            return Err("too many positional arguments".to_string());
        }
        if let Some(name) = keywords.keys().next() {
            return Err(format!("got an unexpected keyword argument '{}'", name));
        }
        Ok(bound)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let mut s = match p.kind {
                    ParamKind::VarPositional => format!("*{}", p.name),
                    ParamKind::VarKeyword => format!("**{}", p.name),
                    _ => p.name.clone(),
                };
                if let Some(ann) = &p.annotation {
                    s.push_str(&format!(": {}", ann));
                }
                if let Some(default) = &p.default {
                    s.push_str(&format!(" = {}", default));
                }
                s
            })
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn greet() -> Signature {
        Signature::new()
            .param(Param::positional("name"))
            .param(Param::positional("greeting").with_default("hello"))
            .param(Param::keyword_only("loud").with_default(false))
    }

    #[test]
    fn bind_fills_defaults() {
        let bound = greet().bind(&Args::new().arg("ann")).unwrap();
        assert_eq!(bound["name"], json!("ann"));
        assert_eq!(bound["greeting"], json!("hello"));
        assert_eq!(bound["loud"], json!(false));
    }

    #[test]
    fn bind_positional_by_keyword() {
        let bound = greet()
            .bind(&Args::new().kwarg("name", "bo").kwarg("loud", true))
            .unwrap();
        assert_eq!(bound["name"], json!("bo"));
        assert_eq!(bound["loud"], json!(true));
    }

    #[test]
    fn bind_rejects_missing_and_surplus() {
        let err = greet().bind(&Args::new()).unwrap_err();
        assert!(err.contains("'name'"));
        let err = greet().bind(&Args::new().arg(1).arg(2).arg(3)).unwrap_err();
        assert!(err.contains("too many"));
        let err = greet().bind(&Args::new().arg(1).kwarg("nope", 1)).unwrap_err();
        assert!(err.contains("'nope'"));
        let err = greet().bind(&Args::new().arg(1).kwarg("name", 2)).unwrap_err();
        assert!(err.contains("multiple values"));
    }

    #[test]
    fn variadic_collects_everything() {
        let bound = Signature::variadic()
            .bind(&Args::new().arg(1).arg(2).kwarg("k", "v"))
            .unwrap();
        assert_eq!(bound["args"], json!([1, 2]));
        assert_eq!(bound["kwargs"], json!({"k": "v"}));
    }

    #[test]
    fn display_reads_like_a_parameter_list() {
        let sig = Signature::new()
            .param(Param::positional("a").annotated("int"))
            .param(Param::var_keyword("kw"));
        assert_eq!(sig.to_string(), "(a: int, **kw)");
    }
}

//! Signature verification of targets against `sig_<target>` contract hooks
//!
//! Every mismatch is collected; a unit fails once with all of them.

use crate::contract::ContractFn;
use crate::function::Function;
use plugtree_core::{Convention, Error, ParamKind, Result, Signature};
use std::collections::{BTreeMap, BTreeSet};

/// What a contract signature allows.
struct Allowed<'a> {
    args: Vec<&'a str>,
    var_positional: Option<usize>,
    keywords: BTreeSet<&'a str>,
    var_keyword: bool,
    annotations: BTreeMap<&'a str, &'a str>,
    defaults: BTreeSet<&'a str>,
}

impl<'a> Allowed<'a> {
    fn of(sig: &'a Signature) -> Self {
        let mut allowed = Self {
            args: Vec::new(),
            var_positional: None,
            keywords: BTreeSet::new(),
            var_keyword: false,
            annotations: BTreeMap::new(),
            defaults: BTreeSet::new(),
        };
        for (ind, param) in sig.params.iter().enumerate() {
            let name = param.name.as_str();
            match param.kind {
                ParamKind::Positional => {
                    allowed.args.push(name);
                    if param.has_default() {
                        allowed.keywords.insert(name);
                    }
                }
                ParamKind::VarPositional => allowed.var_positional = Some(ind),
                ParamKind::KeywordOnly => {
                    allowed.keywords.insert(name);
                }
                ParamKind::VarKeyword => allowed.var_keyword = true,
            }
            if let Some(ann) = &param.annotation {
                allowed.annotations.insert(name, ann.as_str());
            }
            if param.has_default() {
                allowed.defaults.insert(name);
            }
        }
        allowed
    }
}

/// Parameter-level mismatches of `target` against `contract`.
pub fn params(target: &Function, contract: &ContractFn) -> Vec<String> {
    let f_name = target.name();
    let allowed = Allowed::of(contract.function.signature());
    let mut errors = Vec::new();
    let mut seen_var_positional = false;
    let mut target_positional = 0;

    for (ind, param) in target.signature().params.iter().enumerate() {
        let name = param.name.as_str();
        let has_default = param.has_default();

        if let Some(vann) = allowed.annotations.get(name) {
            let ann = param.annotation.as_deref().unwrap_or("<empty>");
            if ann != *vann {
                errors.push(format!("{}: Parameter \"{}\" is type \"{}\" not \"{}\"", f_name, name, ann, vann));
            }
        }

        if allowed.args.contains(&name) && !allowed.defaults.contains(name) && has_default {
            errors.push(format!("{}: Parameter \"{}\" cannot have a default value", f_name, name));
        } else if allowed.defaults.contains(name) && !has_default {
            errors.push(format!("{}: Parameter \"{}\" must have a default value", f_name, name));
        }

        match param.kind {
            ParamKind::Positional => {
                target_positional += 1;
                if ind >= allowed.args.len() {
                    match allowed.var_positional {
                        Some(vp) => {
                            if ind >= vp && seen_var_positional {
                                if !allowed.keywords.contains(name) {
                                    errors.push(format!("Parameter \"{}\" is invalid", name));
                                }
                                if !allowed.var_keyword {
                                    errors.push(format!("{}: Parameter \"{}\" not defined as kw only", f_name, name));
                                }
                            }
                        }
                        None if allowed.var_keyword && !has_default => errors.push(format!(
                            "{}: Parameter \"{}\" is past available positional params",
                            f_name, name
                        )),
                        None if !allowed.var_keyword => errors.push(format!(
                            "{}: Parameter \"{}\" is past available positional params",
                            f_name, name
                        )),
                        None => {}
                    }
                } else if allowed.args[ind] != name {
                    errors.push(format!(
                        "{}: Parameter \"{}\" does not have the correct name: {}",
                        f_name, name, allowed.args[ind]
                    ));
                }
            }
            ParamKind::VarPositional => {
                seen_var_positional = true;
                match allowed.var_positional {
                    None => errors.push(format!("{}: *args are not permitted as a parameter", f_name)),
                    Some(vp) if ind < vp => errors.push(format!(
                        "{}: Parameter \"{}\" is not in the correct position for *args",
                        f_name, name
                    )),
                    Some(_) => {}
                }
            }
            ParamKind::KeywordOnly => {
                if !allowed.keywords.contains(name) && !allowed.var_keyword {
                    errors.push(format!("{}: Parameter \"{}\" is not available as a kwarg", f_name, name));
                }
            }
            ParamKind::VarKeyword => {
                if !allowed.var_keyword {
                    errors.push(format!("{}: **kwargs are not permitted as a parameter", f_name));
                }
            }
        }
    }

    if !target.signature().has_var_positional() {
        for missing in allowed.args.iter().skip(target_positional) {
            errors.push(format!("{}: Parameter \"{}\" is missing", f_name, missing));
        }
        if allowed.var_positional.is_some() {
            errors.push(format!("{}: *args are required by the signature", f_name));
        }
    }
    if allowed.var_keyword && !target.signature().has_var_keyword() {
        errors.push(format!("{}: **kwargs are required by the signature", f_name));
    }

    if !errors.is_empty() {
        errors.push(format!("Enforcing signature: {}", contract.reference));
    }
    errors
}

/// Calling-convention mismatches.
pub fn convention(target: &Function, contract: &ContractFn) -> Vec<String> {
    let want = contract.function.convention();
    let have = target.convention();
    if want == have {
        return Vec::new();
    }
    let message = match want {
        Convention::Async => "Function must be asynchronous",
        Convention::Stream => "Function does not yield, a stream is required by signature",
        Convention::Sync => "Function must be synchronous",
    };
    vec![format!("{}: {}", target.name(), message)]
}

/// Verify every function of a unit against the signature hooks visible to it.
pub fn unit(unit: &str, functions: &BTreeMap<String, Function>, hooks: &[ContractFn]) -> Result<()> {
    let mut errors = Vec::new();
    let mut missing = Vec::new();
    for hook in hooks {
        let Some(target) = hook.phase.target.as_deref() else {
            continue;
        };
        match functions.get(target) {
            Some(function) => {
                errors.extend(params(function, hook));
                errors.extend(convention(function, hook));
            }
            None => missing.push(format!("Function '{}' is missing from {}", target, unit)),
        }
    }
    if errors.is_empty() && missing.is_empty() {
        return Ok(());
    }
    errors.extend(missing);
    Err(Error::SignatureMismatch {
        unit: unit.to_string(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::classify;
    use plugtree_core::{Param, Value};
    use serde_json::json;

    fn target(sig: Signature) -> Function {
        Function::new_async("run", |_| async { Ok(Value::Null) }).with_signature(sig)
    }

    fn contract(sig: Signature) -> ContractFn {
        ContractFn {
            name: "sig_run".into(),
            reference: "contracts.init.sig_run".into(),
            phase: classify("sig_run").unwrap(),
            function: Function::new_async("sig_run", |_| async { Ok(Value::Null) }).with_signature(sig),
        }
    }

    #[test]
    fn matching_signature_passes() {
        let sig = Signature::new().param(Param::positional("a")).param(Param::positional("b").with_default(1));
        assert!(params(&target(sig.clone()), &contract(sig)).is_empty());
    }

    #[test]
    fn default_symmetry_both_ways() {
        let with = Signature::new().param(Param::positional("x").with_default(json!(0)));
        let without = Signature::new().param(Param::positional("x"));

        let errs = params(&target(without.clone()), &contract(with.clone()));
        assert!(errs[0].contains("\"x\" must have a default value"));

        let errs = params(&target(with), &contract(without));
        assert!(errs[0].contains("\"x\" cannot have a default value"));
        assert!(errs.last().unwrap().starts_with("Enforcing signature"));
    }

    #[test]
    fn wrong_name_and_annotation() {
        let c = Signature::new().param(Param::positional("a").annotated("int"));
        let t = Signature::new().param(Param::positional("b").annotated("str"));
        let errs = params(&target(t), &contract(c));
        assert!(errs.iter().any(|e| e.contains("does not have the correct name: a")));
        let t = Signature::new().param(Param::positional("a").annotated("str"));
        let errs = params(&target(t), &contract(Signature::new().param(Param::positional("a").annotated("int"))));
        assert!(errs.iter().any(|e| e.contains("is type \"str\" not \"int\"")));
    }

    #[test]
    fn surplus_and_catch_alls() {
        let c = Signature::new().param(Param::positional("a"));
        let t = Signature::new()
            .param(Param::positional("a"))
            .param(Param::positional("b"))
            .param(Param::var_keyword("kw"));
        let errs = params(&target(t), &contract(c));
        assert!(errs.iter().any(|e| e.contains("\"b\" is past available positional params")));
        assert!(errs.iter().any(|e| e.contains("**kwargs are not permitted")));

        let errs = params(&target(Signature::new().param(Param::positional("a"))), &contract(Signature::variadic()));
        assert!(errs.iter().any(|e| e.contains("*args are required")));
        assert!(errs.iter().any(|e| e.contains("**kwargs are required")));
    }

    #[test]
    fn conventions_must_match() {
        let t = Function::blocking("run", |_| Ok(Value::Null));
        let errs = convention(&t, &contract(Signature::variadic()));
        assert_eq!(errs, vec!["run: Function must be asynchronous".to_string()]);
    }

    #[test]
    fn unit_aggregates_everything() {
        let mut functions = BTreeMap::new();
        functions.insert("run".to_string(), target(Signature::new().param(Param::positional("x"))));
        let mut other = contract(Signature::new());
        other.phase = classify("sig_gone").unwrap();
        let hooks = vec![
            contract(Signature::new().param(Param::positional("x").with_default(1))),
            other,
        ];
        match unit("tools", &functions, &hooks) {
            Err(Error::SignatureMismatch { unit, errors }) => {
                assert_eq!(unit, "tools");
                assert!(errors.iter().any(|e| e.contains("must have a default value")));
                assert!(errors.iter().any(|e| e.contains("Function 'gone' is missing")));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }
}

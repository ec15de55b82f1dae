use std::any::Any;
use std::fmt;

use crate::ast::{CallExpr, Type};
use crate::value::Value;

/// Typed signature of a native callback. The string form
/// `RetType name(ArgType1, ArgType2)` is what compiled programs reference
/// and what linking resolves, byte for byte.
#[derive(Clone, Debug, PartialEq)]
pub struct Signature {
    pub name: String,
    pub ret: Type,
    pub args: Vec<Type>,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}(", self.ret, self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

pub const ATTRIBUTE_EXPERIMENTAL: u8 = 0x01;
pub const ATTRIBUTE_NO_RETURN: u8 = 0x02;
pub const ATTRIBUTE_SIDE_EFFECT_FREE: u8 = 0x04;

/// Argument frame handed to a native callback. The context is the
/// caller-side object the VM was started with (for request handlers, the
/// per-request HTTP context).
pub struct Params<'a> {
    args: &'a [Value],
    result: Value,
    handled: bool,
    pub context: &'a mut dyn Any,
}

impl<'a> Params<'a> {
    pub fn new(args: &'a [Value], context: &'a mut dyn Any) -> Self {
        Self {
            args,
            result: Value::Void,
            handled: false,
            context,
        }
    }

    pub fn count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> &Value {
        &self.args[index]
    }

    pub fn set_result(&mut self, value: Value) {
        self.result = value;
    }

    /// Marks the request as handled; the VM terminates the current handler
    /// with a positive verdict when a native handler sets this.
    pub fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    pub fn result(&self) -> &Value {
        &self.result
    }

    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn into_result(self) -> Value {
        self.result
    }
}

pub type NativeFn = Box<dyn Fn(&mut Params) + Send + Sync>;

/// Code-generation-time inspection hook; rejecting returns the message of
/// the TypeError diagnostic to emit.
pub type Verifier = Box<dyn Fn(&CallExpr) -> std::result::Result<(), String> + Send + Sync>;

/// One host-provided callback: a function (produces a value) or a handler
/// (produces the handled verdict).
pub struct NativeCallback {
    signature: Signature,
    is_handler: bool,
    param_names: Vec<String>,
    defaults: Vec<Option<Value>>,
    attributes: u8,
    verifier: Option<Verifier>,
    function: Option<NativeFn>,
}

impl NativeCallback {
    fn new(name: &str, ret: Type, is_handler: bool) -> Self {
        Self {
            signature: Signature {
                name: name.to_string(),
                ret,
                args: vec![],
            },
            is_handler,
            param_names: vec![],
            defaults: vec![],
            attributes: 0,
            verifier: None,
            function: None,
        }
    }

    // signature builder

    pub fn param(&mut self, ty: Type, name: &str) -> &mut Self {
        self.signature.args.push(ty);
        self.param_names.push(name.to_string());
        self.defaults.push(None);
        self
    }

    pub fn param_default(&mut self, ty: Type, name: &str, default: Value) -> &mut Self {
        self.signature.args.push(ty);
        self.param_names.push(name.to_string());
        self.defaults.push(Some(default));
        self
    }

    // attributes

    pub fn set_no_return(&mut self) -> &mut Self {
        self.attributes |= ATTRIBUTE_NO_RETURN;
        self
    }

    pub fn set_read_only(&mut self) -> &mut Self {
        self.attributes |= ATTRIBUTE_SIDE_EFFECT_FREE;
        self
    }

    pub fn set_experimental(&mut self) -> &mut Self {
        self.attributes |= ATTRIBUTE_EXPERIMENTAL;
        self
    }

    pub fn verifier(&mut self, verifier: Verifier) -> &mut Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn bind(&mut self, function: NativeFn) -> &mut Self {
        self.function = Some(function);
        self
    }

    // introspection

    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_handler(&self) -> bool {
        self.is_handler
    }

    pub fn has_attribute(&self, attribute: u8) -> bool {
        self.attributes & attribute != 0
    }

    pub fn is_experimental(&self) -> bool {
        self.has_attribute(ATTRIBUTE_EXPERIMENTAL)
    }

    pub fn param_name(&self, index: usize) -> &str {
        &self.param_names[index]
    }

    pub fn find_param(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|n| n == name)
    }

    pub fn default_param(&self, index: usize) -> Option<&Value> {
        self.defaults.get(index).and_then(|d| d.as_ref())
    }

    pub fn verify(&self, call: &CallExpr) -> std::result::Result<(), String> {
        match &self.verifier {
            Some(verifier) => verifier(call),
            None => Ok(()),
        }
    }

    pub fn invoke(&self, params: &mut Params) {
        if let Some(function) = &self.function {
            function(params);
        }
    }
}

/// Registry of native callbacks a program links against.
#[derive(Default)]
pub struct Runtime {
    callbacks: Vec<NativeCallback>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, name: &str, ret: Type) -> &mut NativeCallback {
        self.callbacks.push(NativeCallback::new(name, ret, false));
        self.callbacks.last_mut().unwrap()
    }

    pub fn register_handler(&mut self, name: &str) -> &mut NativeCallback {
        self.callbacks.push(NativeCallback::new(name, Type::Bool, true));
        self.callbacks.last_mut().unwrap()
    }

    /// Verbatim signature-string lookup, used by linking.
    pub fn find(&self, signature: &str) -> Option<usize> {
        self.callbacks
            .iter()
            .position(|cb| cb.signature.to_string() == signature)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.callbacks.iter().position(|cb| cb.name() == name)
    }

    pub fn callback(&self, index: usize) -> &NativeCallback {
        &self.callbacks[index]
    }

    pub fn callbacks(&self) -> &[NativeCallback] {
        &self.callbacks
    }

    /// Module import hook. Plugin discovery and loading live outside the
    /// core; imports are recorded on the program and accepted here.
    pub fn import(&self, module: &str, path: &str) -> bool {
        debug!("import module '{}' from '{}'", module, path);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_string_form() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("req.header", Type::String)
            .param(Type::String, "name");
        runtime.register_handler("serve");

        let cb = runtime.callback(0);
        assert_eq!(cb.signature().to_string(), "string req.header(string)");
        let cb = runtime.callback(1);
        assert_eq!(cb.signature().to_string(), "bool serve()");
    }

    #[test]
    fn find_is_verbatim() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("req.header", Type::String)
            .param(Type::String, "name");

        assert_eq!(runtime.find("string req.header(string)"), Some(0));
        assert_eq!(runtime.find("string req.header(int)"), None);
    }

    #[test]
    fn named_params_and_defaults() {
        let mut runtime = Runtime::new();
        runtime
            .register_handler("accesslog")
            .param(Type::String, "file")
            .param_default(Type::Number, "mode", Value::Number(0o644));

        let cb = runtime.callback(0);
        assert_eq!(cb.find_param("mode"), Some(1));
        assert_eq!(cb.default_param(0), None);
        assert_eq!(cb.default_param(1), Some(&Value::Number(0o644)));
    }

    #[test]
    fn invoke_produces_result_and_verdict() {
        let mut runtime = Runtime::new();
        runtime
            .register_function("magic", Type::Number)
            .bind(Box::new(|params| {
                params.set_result(Value::Number(42));
            }));
        runtime.register_handler("finish").bind(Box::new(|params| {
            params.set_handled(true);
        }));

        let mut context = ();
        let args: Vec<Value> = vec![];

        let mut params = Params::new(&args, &mut context);
        runtime.callback(0).invoke(&mut params);
        assert_eq!(params.result(), &Value::Number(42));
        assert!(!params.handled());

        let mut params = Params::new(&args, &mut context);
        runtime.callback(1).invoke(&mut params);
        assert!(params.handled());
    }
}

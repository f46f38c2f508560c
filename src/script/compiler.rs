//! Script compiler
//!
//! Turns serialized [`InstructionDesc`] descriptors into an executable
//! [`Script`], validating them against a [`CompilerEnv`] describing the
//! device: its attributes and permissions, registered message types,
//! channels and request templates.
//!
//! Compilation is not fail-fast. Every descriptor is checked and every
//! problem lands in one [`CompileReport`]; descriptors that failed are
//! lowered to no-ops so validation of the rest continues with an intact
//! program shape. A report with any error fails the compile.
//!
//! Two guarantees the rest of the runtime relies on:
//!
//! - every compiled script ends in a stop instruction, whatever the
//!   descriptors say, so executions always terminate through the same path;
//! - the emit list (sample slot order) and set list (writable attributes
//!   consumed from `param`) are fixed here, so runners never search for
//!   slots at execution time.

use crate::channel::{Channel, FieldDescriptor, Mapper};
use crate::expr::Evaluator;
use crate::script::context::PARAM_VARIABLE;
use crate::script::instruction::{
    Instruction, InstructionKind, ParameterBinding, ResultTarget,
};
use crate::script::Script;
use crate::types::{Attribute, AttributeType, Permission};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Serialized form of one script instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstructionDesc {
    /// Declare a primitive variable
    CreatePrimitive {
        variable: String,
        #[serde(rename = "type")]
        ty: AttributeType,
    },
    /// Declare a message variable of a registered type
    CreateComplex {
        variable: String,
        message_type: String,
    },
    /// Assign to a variable, or to one field of a message variable
    Set {
        variable: String,
        #[serde(default)]
        field: Option<String>,
        value: String,
    },
    /// Append to a list field of a message variable
    Append {
        variable: String,
        field: String,
        value: String,
    },
    /// Write into the sample slot of a device attribute
    Put { attribute: String, value: String },
    /// Close the current sample
    Emit,
    /// Conditional block
    If {
        condition: String,
        then: Vec<InstructionDesc>,
        #[serde(default, rename = "else")]
        otherwise: Vec<InstructionDesc>,
    },
    /// Iterate a list field of a message variable
    Foreach {
        variable: String,
        field: String,
        element: String,
        #[serde(default)]
        index: Option<String>,
        body: Vec<InstructionDesc>,
    },
    /// Asynchronous I/O request
    Submit {
        request: String,
        channel: String,
        #[serde(default)]
        parameters: Vec<ParamBinding>,
        #[serde(default)]
        result: Option<ResultBinding>,
    },
    /// Abort with a script-declared error
    Error { message: String },
    /// Debugger hook
    Breakpoint,
    /// Reject the requested sampling period
    UnsupportedPeriod { suggested: String },
    /// Terminate
    Stop,
}

/// One named expression bound to a submit-request parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamBinding {
    pub name: String,
    pub value: String,
}

/// Destination of a submit's response: declares `variable` as a message of
/// `message_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBinding {
    pub variable: String,
    pub message_type: String,
}

/// A device attribute with its access permission
#[derive(Debug, Clone)]
pub struct DeviceAttribute {
    pub attribute: Attribute,
    pub permission: Permission,
}

/// Parameter schema of one submittable request
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub name: String,
    pub parameters: Vec<FieldDescriptor>,
}

impl RequestTemplate {
    pub fn new(name: impl Into<String>, parameters: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }

    fn parameter(&self, name: &str) -> Option<&FieldDescriptor> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Everything the compiler validates descriptors against
pub struct CompilerEnv {
    evaluator: Arc<dyn Evaluator>,
    attributes: HashMap<String, DeviceAttribute>,
    mappers: HashMap<String, Arc<dyn Mapper>>,
    channels: HashMap<String, Arc<dyn Channel>>,
    requests: HashMap<String, RequestTemplate>,
}

impl CompilerEnv {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            attributes: HashMap::new(),
            mappers: HashMap::new(),
            channels: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute, permission: Permission) {
        self.attributes.insert(
            attribute.id.clone(),
            DeviceAttribute {
                attribute,
                permission,
            },
        );
    }

    pub fn add_mapper(&mut self, mapper: Arc<dyn Mapper>) {
        self.mappers.insert(mapper.message_type().to_string(), mapper);
    }

    pub fn add_channel(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.id().to_string(), channel);
    }

    pub fn add_request(&mut self, template: RequestTemplate) {
        self.requests.insert(template.name.clone(), template);
    }
}

/// One problem found during compilation
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    #[error("variable '{0}' declared twice")]
    DuplicateVariable(String),

    #[error("variable '{0}' used before declaration")]
    UndeclaredVariable(String),

    #[error("'{0}' is a reserved name")]
    ReservedName(String),

    #[error("variable '{variable}' is primitive and has no field '{field}'")]
    NotComplex { variable: String, field: String },

    #[error("variable '{variable}' is a message and needs a field selector")]
    FieldRequired { variable: String },

    #[error("message type '{0}' is not registered")]
    UnknownMessageType(String),

    #[error("message type '{message_type}' has no field '{field}'")]
    UnknownField {
        message_type: String,
        field: String,
    },

    #[error("field '{field}' of '{message_type}' is not a list")]
    NotAList {
        message_type: String,
        field: String,
    },

    #[error("field '{field}' of '{message_type}' is a list")]
    IsAList {
        message_type: String,
        field: String,
    },

    #[error("attribute '{0}' does not exist")]
    UnknownAttribute(String),

    #[error("attribute '{attribute}' is not {access}")]
    PermissionDenied { attribute: String, access: String },

    #[error("channel '{0}' is not registered")]
    UnknownChannel(String),

    #[error("request '{0}' is not registered")]
    UnknownRequest(String),

    #[error("request '{request}' has no parameter '{parameter}'")]
    UnknownRequestParameter { request: String, parameter: String },

    #[error("request parameter '{0}' bound twice")]
    DuplicateRequestParameter(String),

    #[error("invalid expression '{source_text}': {message}")]
    BadExpression {
        source_text: String,
        message: String,
    },

    #[error("unreachable instructions after '{0}'")]
    Unreachable(&'static str),

    #[error("emit requires at least one put")]
    EmitWithoutPut,
}

/// Accumulated result of a failed compilation
#[derive(Debug, Clone)]
pub struct CompileReport {
    errors: Vec<CompileError>,
}

impl CompileReport {
    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for CompileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} compile error(s):", self.errors.len())?;
        for error in &self.errors {
            writeln!(f, "  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileReport {}

/// Compile `descriptors` into an executable script
pub fn compile(
    name: impl Into<String>,
    descriptors: &[InstructionDesc],
    env: &CompilerEnv,
) -> std::result::Result<Arc<Script>, CompileReport> {
    let name = name.into();
    let mut compiler = Compiler {
        env,
        symbols: HashMap::new(),
        errors: Vec::new(),
        emit: Vec::new(),
        set: Vec::new(),
        saw_put: false,
        saw_emit: false,
    };

    let lowered = compiler.lower_block(descriptors);

    if compiler.saw_emit && !compiler.saw_put {
        compiler.errors.push(CompileError::EmitWithoutPut);
    }
    if !compiler.errors.is_empty() {
        return Err(CompileReport {
            errors: compiler.errors,
        });
    }

    // The graph always terminates through a stop node, even when the
    // descriptors already end in one (the appended node is then unreachable
    // but harmless).
    let stop = Instruction::new(InstructionKind::Stop, None);
    let entry = link(lowered, Some(stop.clone())).unwrap_or(stop);

    debug!(
        script = name.as_str(),
        emit = compiler.emit.len(),
        set = compiler.set.len(),
        "script compiled"
    );
    Ok(Arc::new(Script::new(
        name,
        entry,
        compiler.emit,
        compiler.set,
    )))
}

/// What a declared variable holds
enum Symbol {
    Primitive(AttributeType),
    Complex(Arc<dyn Mapper>),
}

/// Validated intermediate form, linked into the graph in a second pass
enum Lowered {
    Plain(InstructionKind),
    If {
        condition: String,
        then_body: Vec<Lowered>,
        else_body: Vec<Lowered>,
    },
    Foreach {
        variable: String,
        field: String,
        element: String,
        index: Option<String>,
        body: Vec<Lowered>,
    },
}

struct Compiler<'a> {
    env: &'a CompilerEnv,
    symbols: HashMap<String, Symbol>,
    errors: Vec<CompileError>,
    /// Sample slot order, one entry per distinct put attribute
    emit: Vec<Attribute>,
    /// Writable attributes referenced through `param`, in first-use order
    set: Vec<Attribute>,
    saw_put: bool,
    saw_emit: bool,
}

impl Compiler<'_> {
    fn lower_block(&mut self, descriptors: &[InstructionDesc]) -> Vec<Lowered> {
        let mut lowered = Vec::with_capacity(descriptors.len());
        let mut terminal: Option<&'static str> = None;

        for desc in descriptors {
            if let Some(kind) = terminal.take() {
                self.errors.push(CompileError::Unreachable(kind));
            }
            terminal = match desc {
                InstructionDesc::Stop => Some("stop"),
                InstructionDesc::Error { .. } => Some("error"),
                InstructionDesc::UnsupportedPeriod { .. } => Some("unsupported_period"),
                _ => None,
            };
            lowered.push(self.lower_one(desc));
        }
        lowered
    }

    fn lower_one(&mut self, desc: &InstructionDesc) -> Lowered {
        match desc {
            InstructionDesc::CreatePrimitive { variable, ty } => {
                if self.declare(variable, Symbol::Primitive(*ty)) {
                    Lowered::Plain(InstructionKind::CreatePrimitive {
                        variable: variable.clone(),
                    })
                } else {
                    self.noop()
                }
            }
            InstructionDesc::CreateComplex {
                variable,
                message_type,
            } => match self.env.mappers.get(message_type) {
                Some(mapper) => {
                    if self.declare(variable, Symbol::Complex(mapper.clone())) {
                        Lowered::Plain(InstructionKind::CreateComplex {
                            variable: variable.clone(),
                        })
                    } else {
                        self.noop()
                    }
                }
                None => {
                    self.errors
                        .push(CompileError::UnknownMessageType(message_type.clone()));
                    self.noop()
                }
            },
            InstructionDesc::Set {
                variable,
                field,
                value,
            } => self.lower_set(variable, field.as_deref(), value),
            InstructionDesc::Append {
                variable,
                field,
                value,
            } => self.lower_append(variable, field, value),
            InstructionDesc::Put { attribute, value } => self.lower_put(attribute, value),
            InstructionDesc::Emit => {
                self.saw_emit = true;
                Lowered::Plain(InstructionKind::Emit)
            }
            InstructionDesc::If {
                condition,
                then,
                otherwise,
            } => {
                self.check_expression(condition);
                // Declarations leak out of branches: the variable scope of a
                // script is flat.
                let then_body = self.lower_block(then);
                let else_body = self.lower_block(otherwise);
                Lowered::If {
                    condition: condition.clone(),
                    then_body,
                    else_body,
                }
            }
            InstructionDesc::Foreach {
                variable,
                field,
                element,
                index,
                body,
            } => self.lower_foreach(variable, field, element, index.as_deref(), body),
            InstructionDesc::Submit {
                request,
                channel,
                parameters,
                result,
            } => self.lower_submit(request, channel, parameters, result.as_ref()),
            InstructionDesc::Error { message } => Lowered::Plain(InstructionKind::Error {
                message: message.clone(),
            }),
            InstructionDesc::Breakpoint => Lowered::Plain(InstructionKind::Breakpoint),
            InstructionDesc::UnsupportedPeriod { suggested } => {
                self.check_expression(suggested);
                Lowered::Plain(InstructionKind::UnsupportedPeriod {
                    suggested: suggested.clone(),
                })
            }
            InstructionDesc::Stop => Lowered::Plain(InstructionKind::Stop),
        }
    }

    fn lower_set(&mut self, variable: &str, field: Option<&str>, value: &str) -> Lowered {
        self.check_expression(value);
        match (self.symbols.get(variable), field) {
            (Some(Symbol::Primitive(ty)), None) => Lowered::Plain(InstructionKind::SetPrimitive {
                variable: variable.to_string(),
                ty: *ty,
                expression: value.to_string(),
            }),
            (Some(Symbol::Primitive(_)), Some(field)) => {
                self.errors.push(CompileError::NotComplex {
                    variable: variable.to_string(),
                    field: field.to_string(),
                });
                self.noop()
            }
            (Some(Symbol::Complex(_)), None) => {
                self.errors.push(CompileError::FieldRequired {
                    variable: variable.to_string(),
                });
                self.noop()
            }
            (Some(Symbol::Complex(mapper)), Some(field)) => {
                let mapper = mapper.clone();
                match self.message_field(&mapper, field, false) {
                    Some(descriptor) => Lowered::Plain(InstructionKind::SetField {
                        variable: variable.to_string(),
                        field: field.to_string(),
                        ty: descriptor.ty,
                        expression: value.to_string(),
                    }),
                    None => self.noop(),
                }
            }
            (None, _) => {
                self.errors
                    .push(CompileError::UndeclaredVariable(variable.to_string()));
                self.noop()
            }
        }
    }

    fn lower_append(&mut self, variable: &str, field: &str, value: &str) -> Lowered {
        self.check_expression(value);
        match self.symbols.get(variable) {
            Some(Symbol::Complex(mapper)) => {
                let mapper = mapper.clone();
                match self.message_field(&mapper, field, true) {
                    Some(descriptor) => Lowered::Plain(InstructionKind::Append {
                        variable: variable.to_string(),
                        field: field.to_string(),
                        ty: descriptor.ty,
                        expression: value.to_string(),
                    }),
                    None => self.noop(),
                }
            }
            Some(Symbol::Primitive(_)) => {
                self.errors.push(CompileError::NotComplex {
                    variable: variable.to_string(),
                    field: field.to_string(),
                });
                self.noop()
            }
            None => {
                self.errors
                    .push(CompileError::UndeclaredVariable(variable.to_string()));
                self.noop()
            }
        }
    }

    fn lower_put(&mut self, attribute: &str, value: &str) -> Lowered {
        self.check_expression(value);
        let device = match self.env.attributes.get(attribute) {
            Some(device) => device.clone(),
            None => {
                self.errors
                    .push(CompileError::UnknownAttribute(attribute.to_string()));
                return self.noop();
            }
        };
        if !device.permission.readable() {
            self.errors.push(CompileError::PermissionDenied {
                attribute: attribute.to_string(),
                access: "readable".to_string(),
            });
            return self.noop();
        }

        // Repeated puts of the same attribute reuse its slot, so emitting
        // after several puts of one attribute sees only the last value.
        let slot = match self.emit.iter().position(|a| a.id == attribute) {
            Some(slot) => slot,
            None => {
                self.emit.push(device.attribute.clone());
                self.emit.len() - 1
            }
        };
        self.saw_put = true;
        Lowered::Plain(InstructionKind::Put {
            slot,
            ty: device.attribute.ty,
            expression: value.to_string(),
        })
    }

    fn lower_foreach(
        &mut self,
        variable: &str,
        field: &str,
        element: &str,
        index: Option<&str>,
        body: &[InstructionDesc],
    ) -> Lowered {
        let element_ty = match self.symbols.get(variable) {
            Some(Symbol::Complex(mapper)) => {
                let mapper = mapper.clone();
                self.message_field(&mapper, field, true).map(|d| d.ty)
            }
            Some(Symbol::Primitive(_)) => {
                self.errors.push(CompileError::NotComplex {
                    variable: variable.to_string(),
                    field: field.to_string(),
                });
                None
            }
            None => {
                self.errors
                    .push(CompileError::UndeclaredVariable(variable.to_string()));
                None
            }
        };

        let element_ok = self.declare(
            element,
            Symbol::Primitive(element_ty.unwrap_or(AttributeType::Integer)),
        );
        let index_ok = match index {
            Some(index) => self.declare(index, Symbol::Primitive(AttributeType::Integer)),
            None => true,
        };

        let body = self.lower_block(body);
        if element_ty.is_none() || !element_ok || !index_ok {
            return self.noop();
        }
        Lowered::Foreach {
            variable: variable.to_string(),
            field: field.to_string(),
            element: element.to_string(),
            index: index.map(str::to_string),
            body,
        }
    }

    fn lower_submit(
        &mut self,
        request: &str,
        channel: &str,
        parameters: &[ParamBinding],
        result: Option<&ResultBinding>,
    ) -> Lowered {
        let channel = match self.env.channels.get(channel) {
            Some(channel) => Some(channel.clone()),
            None => {
                self.errors
                    .push(CompileError::UnknownChannel(channel.to_string()));
                None
            }
        };

        let template = match self.env.requests.get(request) {
            Some(template) => Some(template.clone()),
            None => {
                self.errors
                    .push(CompileError::UnknownRequest(request.to_string()));
                None
            }
        };

        let mut bindings = Vec::with_capacity(parameters.len());
        for binding in parameters {
            self.check_expression(&binding.value);
            if bindings
                .iter()
                .any(|b: &ParameterBinding| b.name == binding.name)
            {
                self.errors
                    .push(CompileError::DuplicateRequestParameter(binding.name.clone()));
                continue;
            }
            let ty = match &template {
                Some(template) => match template.parameter(&binding.name) {
                    Some(parameter) => parameter.ty,
                    None => {
                        self.errors.push(CompileError::UnknownRequestParameter {
                            request: request.to_string(),
                            parameter: binding.name.clone(),
                        });
                        continue;
                    }
                },
                None => continue,
            };
            bindings.push(ParameterBinding {
                name: binding.name.clone(),
                ty,
                expression: binding.value.clone(),
            });
        }

        // The result binding declares its variable, typed by the response
        // message.
        let target = match result {
            Some(result) => match self.env.mappers.get(&result.message_type) {
                Some(mapper) => {
                    let mapper = mapper.clone();
                    if self.declare(&result.variable, Symbol::Complex(mapper.clone())) {
                        Some(ResultTarget {
                            variable: result.variable.clone(),
                            mapper,
                        })
                    } else {
                        None
                    }
                }
                None => {
                    self.errors
                        .push(CompileError::UnknownMessageType(result.message_type.clone()));
                    None
                }
            },
            None => None,
        };

        match (channel, template) {
            (Some(channel), Some(_)) if result.is_some() == target.is_some() => {
                Lowered::Plain(InstructionKind::Submit {
                    channel,
                    request: request.to_string(),
                    parameters: bindings,
                    result: target,
                })
            }
            _ => self.noop(),
        }
    }

    /// Register a variable; false (with an error recorded) on conflicts
    fn declare(&mut self, name: &str, symbol: Symbol) -> bool {
        if name == PARAM_VARIABLE {
            self.errors
                .push(CompileError::ReservedName(name.to_string()));
            return false;
        }
        if self.symbols.contains_key(name) {
            self.errors
                .push(CompileError::DuplicateVariable(name.to_string()));
            return false;
        }
        self.symbols.insert(name.to_string(), symbol);
        true
    }

    /// Look up a message field, requiring it to be (or not be) a list
    fn message_field(
        &mut self,
        mapper: &Arc<dyn Mapper>,
        field: &str,
        want_list: bool,
    ) -> Option<FieldDescriptor> {
        match mapper.field(field) {
            Some(descriptor) if descriptor.list == want_list => Some(descriptor.clone()),
            Some(_) if want_list => {
                self.errors.push(CompileError::NotAList {
                    message_type: mapper.message_type().to_string(),
                    field: field.to_string(),
                });
                None
            }
            Some(_) => {
                self.errors.push(CompileError::IsAList {
                    message_type: mapper.message_type().to_string(),
                    field: field.to_string(),
                });
                None
            }
            None => {
                self.errors.push(CompileError::UnknownField {
                    message_type: mapper.message_type().to_string(),
                    field: field.to_string(),
                });
                None
            }
        }
    }

    /// Validate an expression: syntax, variable references, and `param`
    /// attribute accesses
    fn check_expression(&mut self, source: &str) {
        if let Err(e) = self.env.evaluator.validate(source) {
            self.errors.push(CompileError::BadExpression {
                source_text: source.to_string(),
                message: e.to_string(),
            });
            return;
        }

        let refs = scan_references(source);
        for variable in refs.variables {
            if !self.symbols.contains_key(&variable) {
                self.errors
                    .push(CompileError::UndeclaredVariable(variable));
            }
        }
        for field in refs.param_fields {
            // Runtime-supplied parameters, not device attributes.
            if BUILTIN_PARAM_FIELDS.contains(&field.as_str()) {
                continue;
            }
            match self.env.attributes.get(&field) {
                Some(device) if device.permission.writable() => {
                    if !self.set.iter().any(|a| a.id == field) {
                        self.set.push(device.attribute.clone());
                    }
                }
                Some(_) => self.errors.push(CompileError::PermissionDenied {
                    attribute: field,
                    access: "writable".to_string(),
                }),
                None => self.errors.push(CompileError::UnknownAttribute(field)),
            }
        }
    }

    fn noop(&self) -> Lowered {
        Lowered::Plain(InstructionKind::Noop)
    }
}

/// Link a lowered block into an instruction chain ending in `continuation`
fn link(lowered: Vec<Lowered>, continuation: Option<Arc<Instruction>>) -> Option<Arc<Instruction>> {
    let mut next = continuation;
    for item in lowered.into_iter().rev() {
        next = Some(match item {
            Lowered::Plain(kind) => Instruction::new(kind, next),
            Lowered::If {
                condition,
                then_body,
                else_body,
            } => {
                let then_head = link(then_body, next.clone());
                let else_head = link(else_body, next.clone());
                Instruction::new(
                    InstructionKind::If {
                        condition,
                        then_head,
                        else_head,
                    },
                    next,
                )
            }
            Lowered::Foreach {
                variable,
                field,
                element,
                index,
                body,
            } => Instruction::new_loop(variable, field, element, index, next, |loop_end| {
                link(body, Some(loop_end.clone())).unwrap_or(loop_end)
            }),
        });
    }
    next
}

/// Identifiers an expression references
#[derive(Default)]
struct ExpressionRefs {
    /// Bare variable references
    variables: Vec<String>,
    /// Fields accessed on the reserved `param` record
    param_fields: Vec<String>,
}

/// `param` fields the runtime itself populates: the requested sampling
/// period and the triggering device message
const BUILTIN_PARAM_FIELDS: &[&str] = &["period", "message"];

/// Rhai keywords and literals that look like identifiers
const KEYWORDS: &[&str] = &[
    "true", "false", "if", "else", "let", "const", "fn", "return", "while", "loop", "for", "in",
    "switch", "do", "until", "type_of",
];

/// Scan an expression for variable references and `param.<attribute>`
/// accesses.
///
/// This is a lexical scan, not a parse: string literals and numbers are
/// skipped, identifiers preceded by `.` are field accesses, identifiers
/// followed by `(` are function calls. Rhai has already accepted the
/// expression syntactically by the time this runs.
fn scan_references(source: &str) -> ExpressionRefs {
    let chars: Vec<char> = source.chars().collect();
    let mut refs = ExpressionRefs::default();
    let mut previous: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            while i < chars.len() {
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    i += 1;
                    break;
                }
                i += 1;
            }
            previous = Some(quote);
            continue;
        }

        if c.is_ascii_digit() {
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '_')
            {
                i += 1;
            }
            previous = Some('0');
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let is_field_access = previous == Some('.');

            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let following = chars.get(j).copied();

            if !is_field_access {
                if ident == PARAM_VARIABLE {
                    if following == Some('.') {
                        let mut k = j + 1;
                        while k < chars.len() && chars[k].is_whitespace() {
                            k += 1;
                        }
                        let field_start = k;
                        while k < chars.len()
                            && (chars[k].is_ascii_alphanumeric() || chars[k] == '_')
                        {
                            k += 1;
                        }
                        if k > field_start {
                            refs.param_fields.push(chars[field_start..k].iter().collect());
                        }
                    }
                } else if following != Some('(') && !KEYWORDS.contains(&ident.as_str()) {
                    refs.variables.push(ident);
                }
            }
            previous = Some('x');
            continue;
        }

        if !c.is_whitespace() {
            previous = Some(c);
        }
        i += 1;
    }
    refs
}

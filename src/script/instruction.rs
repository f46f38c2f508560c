//! Compiled instruction graph
//!
//! A compiled script is an immutable, `Arc`-linked graph of [`Instruction`]
//! nodes shared by all concurrent executions. Straight-line code is a chain
//! of `next` pointers; `if` branches are spliced so both arms rejoin the
//! continuation; `foreach` bodies end in a hidden loop-end node holding a
//! `Weak` back-edge to the loop head, which keeps the graph free of
//! reference cycles.
//!
//! Nodes carry no mutable state. Anything per-execution (a loop index, a
//! submit's sent flag) lives in the [`ExecutionContext`]'s instruction-local
//! store, keyed by the node's process-wide unique id.

use crate::channel::{Channel, IoRequest, Mapper, Payload};
use crate::error::{Result, RuntimeError};
use crate::script::context::{ExecutionContext, PARAM_VARIABLE};
use crate::types::{AttributeType, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_INSTRUCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Result of one submitted I/O request, parked until the runner resumes
pub(crate) type IoOutcome = std::result::Result<Option<Payload>, RuntimeError>;

/// What the runner should do after executing one instruction
#[derive(Debug)]
pub(crate) enum Step {
    /// Advance to the given instruction
    Next(Option<Arc<Instruction>>),
    /// Park this execution; an I/O completion will resume it at the same
    /// instruction
    Suspend,
    /// The script finished normally
    Stop,
}

/// Hooks an instruction needs from its runner
pub(crate) trait InstructionServices {
    /// Hand a request to a channel on behalf of the current execution
    fn submit(&self, channel: &Arc<dyn Channel>, request: IoRequest);

    /// A breakpoint instruction was reached
    fn breakpoint(&self, context: &ExecutionContext);
}

/// Everything one instruction step may touch
pub(crate) struct ExecEnv<'a> {
    pub context: &'a mut ExecutionContext,
    /// Slot holding the outcome of the in-flight submit, if any
    pub io: &'a mut Option<IoOutcome>,
    pub services: &'a dyn InstructionServices,
}

/// Expression bound to one submit-request parameter
#[derive(Clone)]
pub(crate) struct ParameterBinding {
    pub name: String,
    pub ty: AttributeType,
    pub expression: String,
}

/// Destination for a submit's response payload
#[derive(Clone)]
pub(crate) struct ResultTarget {
    pub variable: String,
    pub mapper: Arc<dyn Mapper>,
}

pub(crate) enum InstructionKind {
    /// Declare a primitive variable, initialized to null
    CreatePrimitive { variable: String },
    /// Declare a message variable as an empty record
    CreateComplex { variable: String },
    /// Assign an expression result to a primitive variable
    SetPrimitive {
        variable: String,
        ty: AttributeType,
        expression: String,
    },
    /// Assign an expression result to one field of a message variable
    SetField {
        variable: String,
        field: String,
        ty: AttributeType,
        expression: String,
    },
    /// Append an expression result to a list field of a message variable
    Append {
        variable: String,
        field: String,
        ty: AttributeType,
        expression: String,
    },
    /// Write an expression result into a sample slot
    Put {
        slot: usize,
        ty: AttributeType,
        expression: String,
    },
    /// Copy the sample buffer into the completed-sample list
    Emit,
    /// Conditional branch; both arms rejoin `next`
    If {
        condition: String,
        then_head: Option<Arc<Instruction>>,
        else_head: Option<Arc<Instruction>>,
    },
    /// Iterate a list field of a message variable
    Foreach {
        variable: String,
        field: String,
        element: String,
        index: Option<String>,
        body: Arc<Instruction>,
    },
    /// Hidden back-edge closing a foreach body
    LoopEnd { head: Weak<Instruction> },
    /// Submit an I/O request and suspend until its outcome arrives
    Submit {
        channel: Arc<dyn Channel>,
        request: String,
        parameters: Vec<ParameterBinding>,
        result: Option<ResultTarget>,
    },
    /// Abort the execution with a script-declared error
    Error { message: String },
    /// Invoke the attached debugger, then continue
    Breakpoint,
    /// Placeholder substituted for instructions that failed to compile
    Noop,
    /// Reject the requested sampling period, suggesting an alternative
    UnsupportedPeriod { suggested: String },
    /// Terminate the execution normally
    Stop,
}

/// One immutable node of a compiled script
pub struct Instruction {
    id: u64,
    kind: InstructionKind,
    next: Option<Arc<Instruction>>,
}

impl Instruction {
    pub(crate) fn new(kind: InstructionKind, next: Option<Arc<Instruction>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_INSTRUCTION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            next,
        })
    }

    /// Build a foreach node whose body loops back to it.
    ///
    /// `build_body` receives the hidden loop-end node and must return the
    /// body's head, with the loop-end as the body's final continuation.
    pub(crate) fn new_loop(
        variable: String,
        field: String,
        element: String,
        index: Option<String>,
        next: Option<Arc<Instruction>>,
        build_body: impl FnOnce(Arc<Instruction>) -> Arc<Instruction>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|head: &Weak<Instruction>| {
            let loop_end = Self::new(InstructionKind::LoopEnd { head: head.clone() }, None);
            let body = build_body(loop_end);
            Self {
                id: NEXT_INSTRUCTION_ID.fetch_add(1, Ordering::Relaxed),
                kind: InstructionKind::Foreach {
                    variable,
                    field,
                    element,
                    index,
                    body,
                },
                next,
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> &InstructionKind {
        &self.kind
    }

    pub(crate) fn next(&self) -> Option<&Arc<Instruction>> {
        self.next.as_ref()
    }

    fn kind_name(&self) -> &'static str {
        match &self.kind {
            InstructionKind::CreatePrimitive { .. } => "create",
            InstructionKind::CreateComplex { .. } => "create",
            InstructionKind::SetPrimitive { .. } => "set",
            InstructionKind::SetField { .. } => "set",
            InstructionKind::Append { .. } => "append",
            InstructionKind::Put { .. } => "put",
            InstructionKind::Emit => "emit",
            InstructionKind::If { .. } => "if",
            InstructionKind::Foreach { .. } => "foreach",
            InstructionKind::LoopEnd { .. } => "loop-end",
            InstructionKind::Submit { .. } => "submit",
            InstructionKind::Error { .. } => "error",
            InstructionKind::Breakpoint => "breakpoint",
            InstructionKind::Noop => "noop",
            InstructionKind::UnsupportedPeriod { .. } => "unsupported-period",
            InstructionKind::Stop => "stop",
        }
    }

    fn advance(&self) -> Step {
        Step::Next(self.next.clone())
    }

    /// Execute this instruction against `env`
    pub(crate) fn execute(&self, env: &mut ExecEnv<'_>) -> Result<Step> {
        match &self.kind {
            InstructionKind::CreatePrimitive { variable } => {
                env.context.set_variable(variable.clone(), Value::Null);
                Ok(self.advance())
            }
            InstructionKind::CreateComplex { variable } => {
                env.context
                    .set_variable(variable.clone(), Value::Record(Default::default()));
                Ok(self.advance())
            }
            InstructionKind::SetPrimitive {
                variable,
                ty,
                expression,
            } => {
                let value = env.context.evaluate(expression, *ty)?;
                env.context.set_variable(variable.clone(), value);
                Ok(self.advance())
            }
            InstructionKind::SetField {
                variable,
                field,
                ty,
                expression,
            } => {
                let value = env.context.evaluate(expression, *ty)?;
                env.context.set_field(variable, field, value)?;
                Ok(self.advance())
            }
            InstructionKind::Append {
                variable,
                field,
                ty,
                expression,
            } => {
                let value = env.context.evaluate(expression, *ty)?;
                env.context.append_field(variable, field, value)?;
                Ok(self.advance())
            }
            InstructionKind::Put {
                slot,
                ty,
                expression,
            } => {
                let value = env.context.evaluate(expression, *ty)?;
                env.context.put_attribute(*slot, value)?;
                Ok(self.advance())
            }
            InstructionKind::Emit => {
                env.context.emit_sample();
                Ok(self.advance())
            }
            InstructionKind::If {
                condition,
                then_head,
                else_head,
            } => {
                let value = env.context.evaluate(condition, AttributeType::Bool)?;
                let taken = match value.as_bool() {
                    Some(true) => then_head,
                    Some(false) => else_head,
                    None => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "bool".to_string(),
                            found: value.type_name().to_string(),
                        })
                    }
                };
                // Branch arms already chain back into the continuation; an
                // empty arm falls straight through.
                Ok(Step::Next(taken.clone().or_else(|| self.next.clone())))
            }
            InstructionKind::Foreach {
                variable,
                field,
                element,
                index,
                body,
            } => self.step_foreach(env, variable, field, element, index.as_deref(), body),
            InstructionKind::LoopEnd { head } => match head.upgrade() {
                Some(head) => Ok(Step::Next(Some(head))),
                // The head owns the body, so an executing loop-end always
                // has a live head.
                None => Err(RuntimeError::Script(
                    "loop body outlived its loop head".to_string(),
                )),
            },
            InstructionKind::Submit {
                channel,
                request,
                parameters,
                result,
            } => self.step_submit(env, channel, request, parameters, result.as_ref()),
            InstructionKind::Error { message } => Err(RuntimeError::Script(message.clone())),
            InstructionKind::Breakpoint => {
                env.services.breakpoint(env.context);
                Ok(self.advance())
            }
            InstructionKind::Noop => Ok(self.advance()),
            InstructionKind::UnsupportedPeriod { suggested } => {
                let suggested = env
                    .context
                    .evaluate(suggested, AttributeType::Integer)?
                    .as_integer()
                    .unwrap_or(0)
                    .max(0) as u64;
                let requested = requested_period(env.context);
                Err(RuntimeError::UnsupportedPeriod {
                    requested,
                    suggested,
                })
            }
            InstructionKind::Stop => Ok(Step::Stop),
        }
    }

    fn step_foreach(
        &self,
        env: &mut ExecEnv<'_>,
        variable: &str,
        field: &str,
        element: &str,
        index: Option<&str>,
        body: &Arc<Instruction>,
    ) -> Result<Step> {
        let item = {
            let record = match env.context.variable(variable) {
                Some(Value::Record(fields)) => fields,
                Some(other) => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "record".to_string(),
                        found: other.type_name().to_string(),
                    })
                }
                None => return Err(RuntimeError::UnknownVariable(variable.to_string())),
            };
            let items = match record.get(field) {
                Some(Value::List(items)) => items,
                // An absent list field iterates zero times.
                None => {
                    env.context.clear_local(self.id);
                    return Ok(self.advance());
                }
                Some(other) => {
                    return Err(RuntimeError::TypeMismatch {
                        expected: "list".to_string(),
                        found: other.type_name().to_string(),
                    })
                }
            };
            let i = env.context.counter(self.id);
            match items.get(i) {
                Some(item) => Some((i, item.clone())),
                None => None,
            }
        };

        match item {
            Some((i, item)) => {
                env.context.set_variable(element.to_string(), item);
                if let Some(index) = index {
                    env.context
                        .set_variable(index.to_string(), Value::Integer(i as i64));
                }
                env.context.set_counter(self.id, i + 1);
                Ok(Step::Next(Some(body.clone())))
            }
            None => {
                // Reset so a later visit (nested loops) starts fresh.
                env.context.clear_local(self.id);
                Ok(self.advance())
            }
        }
    }

    fn step_submit(
        &self,
        env: &mut ExecEnv<'_>,
        channel: &Arc<dyn Channel>,
        request: &str,
        parameters: &[ParameterBinding],
        result: Option<&ResultTarget>,
    ) -> Result<Step> {
        if !env.context.flag(self.id) {
            // First visit: build the request and park the execution.
            let mut io = IoRequest::new(request);
            for binding in parameters {
                let value = env.context.evaluate(&binding.expression, binding.ty)?;
                io.parameters.insert(binding.name.clone(), value);
            }
            env.context.set_flag(self.id, true);
            env.services.submit(channel, io);
            return Ok(Step::Suspend);
        }

        // Resumed visit: consume the parked outcome.
        env.context.clear_local(self.id);
        let outcome = env
            .io
            .take()
            .ok_or_else(|| RuntimeError::MissingResult(request.to_string()))?;

        let payload = outcome.map_err(|e| {
            if e.is_unsupported_period() {
                e
            } else {
                e.with_context(format!("request '{request}' failed"))
            }
        })?;

        if let Some(target) = result {
            let payload =
                payload.ok_or_else(|| RuntimeError::MissingResult(request.to_string()))?;
            let message = target.mapper.unmarshal(&payload)?;
            env.context
                .set_variable(target.variable.clone(), message.to_value());
        }
        Ok(self.advance())
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruction")
            .field("id", &self.id)
            .field("kind", &self.kind_name())
            .field("next", &self.next.as_ref().map(|n| n.id))
            .finish()
    }
}

/// The caller-requested period, if the script received one
fn requested_period(context: &ExecutionContext) -> u64 {
    match context.variable(PARAM_VARIABLE) {
        Some(Value::Record(fields)) => fields
            .get("period")
            .and_then(Value::as_integer)
            .unwrap_or(0)
            .max(0) as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::RhaiEvaluator;
    use crate::script::context::ContextPool;
    use crate::script::ScriptParams;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct NoServices;

    impl InstructionServices for NoServices {
        fn submit(&self, _channel: &Arc<dyn Channel>, _request: IoRequest) {
            panic!("unexpected submit");
        }

        fn breakpoint(&self, _context: &ExecutionContext) {}
    }

    fn context() -> ExecutionContext {
        let pool = ContextPool::new(Arc::new(RhaiEvaluator::new()));
        let mut ctx = pool.acquire();
        ctx.prepare(Arc::new(Vec::new()), ScriptParams::new());
        ctx
    }

    /// Run a chain to completion, without suspension support
    fn run(entry: Arc<Instruction>, ctx: &mut ExecutionContext) -> Result<()> {
        let mut io = None;
        let mut pc = Some(entry);
        let mut steps = 0;
        while let Some(inst) = pc {
            let mut env = ExecEnv {
                context: ctx,
                io: &mut io,
                services: &NoServices,
            };
            match inst.execute(&mut env)? {
                Step::Next(next) => pc = next,
                Step::Stop => return Ok(()),
                Step::Suspend => panic!("unexpected suspension"),
            }
            steps += 1;
            assert!(steps < 10_000, "runaway execution");
        }
        Ok(())
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Instruction::new(InstructionKind::Stop, None);
        let b = Instruction::new(InstructionKind::Stop, None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_set_then_stop() {
        let stop = Instruction::new(InstructionKind::Stop, None);
        let set = Instruction::new(
            InstructionKind::SetPrimitive {
                variable: "x".to_string(),
                ty: AttributeType::Integer,
                expression: "40 + 2".to_string(),
            },
            Some(stop),
        );
        let create = Instruction::new(
            InstructionKind::CreatePrimitive {
                variable: "x".to_string(),
            },
            Some(set),
        );

        let mut ctx = context();
        run(create, &mut ctx).unwrap();
        assert_eq!(ctx.variable("x"), Some(&Value::Integer(42)));
    }

    #[test]
    fn test_if_branches_rejoin() {
        // if x > 0 { y = 1 } else { y = 2 }; stop
        let build = |cond: &str| {
            let stop = Instruction::new(InstructionKind::Stop, None);
            let then_arm = Instruction::new(
                InstructionKind::SetPrimitive {
                    variable: "y".to_string(),
                    ty: AttributeType::Integer,
                    expression: "1".to_string(),
                },
                Some(stop.clone()),
            );
            let else_arm = Instruction::new(
                InstructionKind::SetPrimitive {
                    variable: "y".to_string(),
                    ty: AttributeType::Integer,
                    expression: "2".to_string(),
                },
                Some(stop.clone()),
            );
            Instruction::new(
                InstructionKind::If {
                    condition: cond.to_string(),
                    then_head: Some(then_arm),
                    else_head: Some(else_arm),
                },
                Some(stop),
            )
        };

        let mut ctx = context();
        ctx.set_variable("x", Value::Integer(5));
        run(build("x > 0"), &mut ctx).unwrap();
        assert_eq!(ctx.variable("y"), Some(&Value::Integer(1)));

        let mut ctx = context();
        ctx.set_variable("x", Value::Integer(-5));
        run(build("x > 0"), &mut ctx).unwrap();
        assert_eq!(ctx.variable("y"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_foreach_iterates_list_field() {
        // foreach e in msg.readings { total = total + e }; stop
        let stop = Instruction::new(InstructionKind::Stop, None);
        let entry = Instruction::new_loop(
            "msg".to_string(),
            "readings".to_string(),
            "e".to_string(),
            Some("i".to_string()),
            Some(stop),
            |loop_end| {
                Instruction::new(
                    InstructionKind::SetPrimitive {
                        variable: "total".to_string(),
                        ty: AttributeType::Integer,
                        expression: "total + e".to_string(),
                    },
                    Some(loop_end),
                )
            },
        );

        let mut ctx = context();
        let mut fields = HashMap::new();
        fields.insert(
            "readings".to_string(),
            Value::List(vec![
                Value::Integer(3),
                Value::Integer(4),
                Value::Integer(5),
            ]),
        );
        ctx.set_variable("msg", Value::Record(fields));
        ctx.set_variable("total", Value::Integer(0));

        run(entry, &mut ctx).unwrap();
        assert_eq!(ctx.variable("total"), Some(&Value::Integer(12)));
        // Loop exposed the final index before exiting.
        assert_eq!(ctx.variable("i"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_foreach_empty_list_skips_body() {
        let stop = Instruction::new(InstructionKind::Stop, None);
        let entry = Instruction::new_loop(
            "msg".to_string(),
            "readings".to_string(),
            "e".to_string(),
            None,
            Some(stop),
            |loop_end| {
                Instruction::new(
                    InstructionKind::Error {
                        message: "body must not run".to_string(),
                    },
                    Some(loop_end),
                )
            },
        );

        let mut ctx = context();
        let mut fields = HashMap::new();
        fields.insert("readings".to_string(), Value::List(Vec::new()));
        ctx.set_variable("msg", Value::Record(fields));
        run(entry, &mut ctx).unwrap();
    }

    #[test]
    fn test_error_instruction_aborts() {
        let inst = Instruction::new(
            InstructionKind::Error {
                message: "boom".to_string(),
            },
            None,
        );
        let mut ctx = context();
        let err = run(inst, &mut ctx).unwrap_err();
        assert!(matches!(err, RuntimeError::Script(m) if m == "boom"));
    }

    #[test]
    fn test_unsupported_period_carries_both_periods() {
        let inst = Instruction::new(
            InstructionKind::UnsupportedPeriod {
                suggested: "100".to_string(),
            },
            None,
        );
        let mut ctx = context();
        let mut params = ScriptParams::new();
        params.insert("period".to_string(), Value::Integer(30));
        ctx.prepare(Arc::new(Vec::new()), params);

        let err = run(inst, &mut ctx).unwrap_err();
        match err {
            RuntimeError::UnsupportedPeriod {
                requested,
                suggested,
            } => {
                assert_eq!(requested, 30);
                assert_eq!(suggested, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_submit_suspends_then_consumes_outcome() {
        struct Recorder(Mutex<Vec<IoRequest>>);

        impl InstructionServices for Recorder {
            fn submit(&self, _channel: &Arc<dyn Channel>, request: IoRequest) {
                self.0.lock().unwrap().push(request);
            }

            fn breakpoint(&self, _context: &ExecutionContext) {}
        }

        let channel: Arc<dyn Channel> = Arc::new(crate::channel::mock::ManualChannel::new());
        let stop = Instruction::new(InstructionKind::Stop, None);
        let submit = Instruction::new(
            InstructionKind::Submit {
                channel,
                request: "read".to_string(),
                parameters: vec![ParameterBinding {
                    name: "address".to_string(),
                    ty: AttributeType::Integer,
                    expression: "16 * 2".to_string(),
                }],
                result: None,
            },
            Some(stop),
        );

        let recorder = Recorder(Mutex::new(Vec::new()));
        let mut ctx = context();
        let mut io = None;

        // First visit parks the execution.
        let step = {
            let mut env = ExecEnv {
                context: &mut ctx,
                io: &mut io,
                services: &recorder,
            };
            submit.execute(&mut env).unwrap()
        };
        assert!(matches!(step, Step::Suspend));
        {
            let sent = recorder.0.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].parameter("address"), Some(&Value::Integer(32)));
        }

        // Resumed visit consumes the outcome and advances.
        io = Some(Ok(None));
        let step = {
            let mut env = ExecEnv {
                context: &mut ctx,
                io: &mut io,
                services: &recorder,
            };
            submit.execute(&mut env).unwrap()
        };
        assert!(matches!(step, Step::Next(Some(_))));
        assert!(io.is_none());
    }

    #[test]
    fn test_submit_resume_without_outcome_fails() {
        let channel: Arc<dyn Channel> = Arc::new(crate::channel::mock::ManualChannel::new());
        let submit = Instruction::new(
            InstructionKind::Submit {
                channel,
                request: "read".to_string(),
                parameters: Vec::new(),
                result: None,
            },
            None,
        );

        let mut ctx = context();
        ctx.set_flag(submit.id(), true);
        let mut io = None;
        let mut env = ExecEnv {
            context: &mut ctx,
            io: &mut io,
            services: &NoServices,
        };
        let err = submit.execute(&mut env).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingResult(_)));
    }
}

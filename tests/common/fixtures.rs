//! A small weather-station device shared by the integration tests
//!
//! One channel, one `weather` message type and a handful of attributes are
//! enough to exercise compilation, suspension and every operation flavor.

use devmux::channel::{Channel, FieldDescriptor, JsonMapper, Mapper, Message, Payload};
use devmux::expr::RhaiEvaluator;
use devmux::script::compiler::{compile, CompilerEnv, InstructionDesc, RequestTemplate};
use devmux::{Attribute, AttributeType, Executor, ExecutorConfig, Permission, Script, Value};
use std::sync::Arc;

pub fn evaluator() -> Arc<RhaiEvaluator> {
    Arc::new(RhaiEvaluator::new())
}

pub fn executor(workers: usize) -> Arc<Executor> {
    Arc::new(Executor::new(
        ExecutorConfig {
            workers,
            shutdown_timeout_ms: 1_000,
        },
        evaluator(),
    ))
}

pub fn temperature() -> Attribute {
    Attribute::new("temperature", AttributeType::Integer)
}

pub fn humidity() -> Attribute {
    Attribute::new("humidity", AttributeType::Integer)
}

pub fn weather_mapper() -> Arc<dyn Mapper> {
    Arc::new(JsonMapper::new(
        "weather",
        vec![
            FieldDescriptor::scalar("temperature", AttributeType::Integer),
            FieldDescriptor::scalar("humidity", AttributeType::Integer),
            FieldDescriptor::list("readings", AttributeType::Integer),
        ],
    ))
}

/// Compiler environment for the weather station bound to `channel`
pub fn weather_env(channel: Arc<dyn Channel>) -> CompilerEnv {
    let mut env = CompilerEnv::new(evaluator());
    env.add_attribute(temperature(), Permission::ReadOnly);
    env.add_attribute(humidity(), Permission::ReadOnly);
    env.add_attribute(
        Attribute::new("threshold", AttributeType::Integer),
        Permission::ReadWrite,
    );
    env.add_mapper(weather_mapper());
    env.add_channel(channel);
    env.add_request(RequestTemplate::new(
        "read",
        vec![FieldDescriptor::scalar("address", AttributeType::Integer)],
    ));
    env.add_request(RequestTemplate::new(
        "write",
        vec![FieldDescriptor::scalar("value", AttributeType::Integer)],
    ));
    env.add_request(RequestTemplate::new(
        "start",
        vec![FieldDescriptor::scalar("period", AttributeType::Integer)],
    ));
    env.add_request(RequestTemplate::new("stop", Vec::new()));
    env
}

/// Compile a script from the JSON descriptor form the descriptor layer
/// produces
pub fn compile_json(name: &str, json: &str, env: &CompilerEnv) -> Arc<Script> {
    let descriptors: Vec<InstructionDesc> =
        serde_json::from_str(json).expect("descriptor JSON must parse");
    compile(name, &descriptors, env).expect("fixture script must compile")
}

/// Wire payload for one weather reading
pub fn weather_payload(temperature: i64, humidity: i64) -> Payload {
    let mapper = weather_mapper();
    let mut message = mapper.create();
    message.set("temperature", Value::Integer(temperature));
    message.set("humidity", Value::Integer(humidity));
    mapper.marshal(&message).expect("payload must marshal")
}

/// Device-pushed weather message
pub fn weather_message(temperature: i64, humidity: i64) -> Message {
    let mut message = Message::new("weather");
    message.set("temperature", Value::Integer(temperature));
    message.set("humidity", Value::Integer(humidity));
    message
}

//! Built-in handlers registered with the loader at startup.

use std::sync::Arc;

use actors::{
    FactoryLoader, HandlerContext, HandlerFactory, HandlerLogic, InitError, LogicError,
};
use fleet_core::{HandlerDefinition, LogLevel};
use serde::Deserialize;
use serde_json::{Value, json};

/// Jobs handed out per `create_more_jobs` call.
const BATCH: u64 = 10;

#[derive(Debug, Deserialize)]
struct SquaresParams {
    count: u64,
}

/// Hands out the numbers `1..=count` and sums the squares clients send back.
pub struct SquaresLogic {
    count: u64,
    next: u64,
    received: u64,
    sum: u64,
}

impl SquaresLogic {
    pub fn new(count: u64) -> Self {
        Self {
            count,
            next: 1,
            received: 0,
            sum: 0,
        }
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }
}

impl HandlerLogic for SquaresLogic {
    fn create_more_jobs(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        let end = (self.next + BATCH).min(self.count + 1);
        for n in self.next..end {
            ctx.push_job(json!({ "n": n }));
        }
        self.next = end;
        Ok(())
    }

    fn process_result(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        input: &Value,
        output: &Value,
    ) -> Result<(), LogicError> {
        let square = output
            .get("square")
            .and_then(Value::as_u64)
            .ok_or_else(|| LogicError::new(format!("no square in output for {}", input)))?;
        self.sum += square;
        self.received += 1;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.received >= self.count
    }

    fn on_finish(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        ctx.log(
            LogLevel::Info,
            format!("sum of squares 1..={} is {}", self.count, self.sum),
        );
        Ok(())
    }
}

pub struct SquaresFactory;

impl HandlerFactory for SquaresFactory {
    fn validate(&self, params: &Value) -> Result<(), String> {
        let params: SquaresParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        if params.count == 0 {
            return Err("count must be positive".to_string());
        }
        Ok(())
    }

    fn create(
        &self,
        _definition: &HandlerDefinition,
        params: &Value,
    ) -> Result<Box<dyn HandlerLogic>, InitError> {
        let params: SquaresParams = serde_json::from_value(params.clone())
            .map_err(|e| InitError::Failed(e.to_string()))?;
        Ok(Box::new(SquaresLogic::new(params.count)))
    }
}

/// Loader with every built-in handler registered.
pub fn loader() -> FactoryLoader {
    FactoryLoader::new().with("squares", Arc::new(SquaresFactory))
}

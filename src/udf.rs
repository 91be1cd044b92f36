//! `ai_llm(text, prompt)` as a DataFusion scalar UDF.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use datafusion::arrow::array::StringArray;
use datafusion::arrow::datatypes::DataType;
use datafusion::common::exec_err;
use datafusion::common::Result;
use datafusion::logical_expr::{
    ColumnarValue, ScalarFunctionArgs, ScalarUDF, ScalarUDFImpl, Signature, Volatility,
};
use datafusion::prelude::SessionContext;
use tokio::runtime::Handle;

use crate::chunk;
use crate::state::Dispatch;
use crate::worker;

pub struct AiLlmFunc {
    signature: Signature,
    dispatch: Arc<Dispatch>,
    runtime: Handle,
}

impl AiLlmFunc {
    pub fn new(dispatch: Arc<Dispatch>, runtime: Handle) -> Self {
        Self {
            signature: Signature::exact(
                vec![DataType::Utf8, DataType::Utf8],
                Volatility::Volatile,
            ),
            dispatch,
            runtime,
        }
    }
}

impl fmt::Debug for AiLlmFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiLlmFunc")
            .field("mode", &self.dispatch.mode().as_str())
            .finish()
    }
}

impl ScalarUDFImpl for AiLlmFunc {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        "ai_llm"
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn return_type(&self, _arg_types: &[DataType]) -> Result<DataType> {
        Ok(DataType::Utf8)
    }

    fn invoke_with_args(&self, args: ScalarFunctionArgs) -> Result<ColumnarValue> {
        let arrays = ColumnarValue::values_to_arrays(&args.args)?;
        if arrays.len() != 2 {
            return exec_err!("ai_llm expects exactly two arguments");
        }
        let Some(texts) = arrays[0].as_any().downcast_ref::<StringArray>() else {
            return exec_err!("ai_llm expects varchar arguments");
        };
        let Some(prompts) = arrays[1].as_any().downcast_ref::<StringArray>() else {
            return exec_err!("ai_llm expects varchar arguments");
        };

        let dispatch = Arc::clone(&self.dispatch);
        let texts = texts.clone();
        let prompts = prompts.clone();
        let parallel = worker::default_parallelism();

        // hand the chunk to the dispatch runtime and block this engine
        // thread on the reply; block_on would panic inside a runtime
        let (tx, rx) = std::sync::mpsc::channel();
        self.runtime.spawn(async move {
            let out = chunk::answer_chunk(&dispatch, &texts, &prompts, parallel).await;
            let _ = tx.send(out);
        });

        match rx.recv() {
            Ok(out) => Ok(ColumnarValue::Array(Arc::new(out))),
            Err(_) => exec_err!("ai_llm dispatch task failed"),
        }
    }
}

/// Registers `ai_llm(VARCHAR, VARCHAR) -> VARCHAR` on the session.
pub fn register_ai_llm(ctx: &SessionContext, dispatch: Arc<Dispatch>, runtime: Handle) {
    ctx.register_udf(ScalarUDF::from(AiLlmFunc::new(dispatch, runtime)));
}

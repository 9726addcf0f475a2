//! HTTP trigger
//!
//! ルートは持たず fallback だけ。method / path に関係なく 1 回 dispatch して、
//! 集計の 1 行（200）か短いエラーメッセージ（500）を返します。
//!
//! dispatch は別 task で走らせる。client が途中で切断して handler の future が
//! drop されても、broker の切断と store の close までは必ず進む。

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_core::app::Dispatcher;
use courier_core::ports::{BrokerConnector, Clock, StoreConnector};

pub fn router<S, B, K>(dispatcher: Arc<Dispatcher<S, B, K>>) -> Router
where
    S: StoreConnector + 'static,
    B: BrokerConnector + 'static,
    K: Clock + 'static,
{
    Router::new()
        .fallback(check_tasks::<S, B, K>)
        .with_state(dispatcher)
}

async fn check_tasks<S, B, K>(State(dispatcher): State<Arc<Dispatcher<S, B, K>>>) -> Response
where
    S: StoreConnector + 'static,
    B: BrokerConnector + 'static,
    K: Clock + 'static,
{
    let run = tokio::spawn(async move { dispatcher.run().await });
    match run.await {
        Ok(Ok(report)) => (StatusCode::OK, report.to_string()).into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, e.public_message()).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "dispatch task did not finish");
            (StatusCode::INTERNAL_SERVER_ERROR, "Task check failed").into_response()
        }
    }
}

use crate::cluster::PodLister;
use crate::dashboard::{self, DashboardView};
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::{Router, routing::get};
use tracing::error;

pub async fn dashboard_page<P: PodLister>(State(state): State<AppState<P>>) -> Response {
    let cancel = state.shutdown.child_token();
    // dropped with the handler future when the client disconnects
    let _cancel_on_drop = cancel.clone().drop_guard();

    let (status, view) = match dashboard::build_view(&state, &cancel).await {
        Ok(view) => (StatusCode::OK, view),
        Err(e) => {
            error!("Error building dashboard: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, DashboardView::failed(e))
        }
    };

    match dashboard::render(&state.templates, &view) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            error!("Error rendering dashboard: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render dashboard").into_response()
        }
    }
}

pub fn create_app<P: PodLister>(state: AppState<P>) -> Router {
    Router::new()
        .route("/", get(dashboard_page::<P>))
        .with_state(state)
}

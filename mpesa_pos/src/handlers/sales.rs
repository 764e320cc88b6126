use crate::state::AppState;
use actix_web::{Error, HttpResponse, error::InternalError, get, http::StatusCode, web};

#[get("/sales")]
pub async fn get_sales(app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let sales = app_state.db.get_sales().await.map_err(|e| {
        log::error!("Failed to get sales: {}", e);
        InternalError::new(
            "Failed to fetch sales. Please try again later.",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    Ok(HttpResponse::Ok().json(sales))
}

#[get("/sales/{sale_id}")]
pub async fn get_sale_by_id(
    path: web::Path<i64>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let sale_id = path.into_inner();

    let sale = app_state
        .db
        .get_sale(sale_id)
        .await
        .map_err(|e| {
            log::error!("Database error fetching sale {}: {}", sale_id, e);
            InternalError::new(
                "Internal server error while fetching sale.",
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        })?
        .ok_or_else(|| {
            log::warn!("Sale not found: {}", sale_id);
            InternalError::new("Sale with provided ID not found.", StatusCode::NOT_FOUND)
        })?;

    Ok(HttpResponse::Ok().json(sale))
}

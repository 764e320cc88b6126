use crate::state::AppState;
use actix_web::{Error, HttpResponse, error::InternalError, get, http::StatusCode, web};

#[get("/products")]
pub async fn get_products(app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let products = app_state.db.get_products().await.map_err(|e| {
        log::error!("Failed to get products: {}", e);
        InternalError::new(
            "Failed to fetch products. Please try again later.",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    Ok(HttpResponse::Ok().json(products))
}

#[get("/products/{product_id}")]
pub async fn get_product_by_id(
    path: web::Path<i64>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let product_id = path.into_inner();

    let maybe_product = app_state.db.get_product(product_id).await.map_err(|e| {
        log::error!("Database error fetching product {}: {}", product_id, e);
        InternalError::new(
            "Internal server error while fetching product.",
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    match maybe_product {
        Some(product) => Ok(HttpResponse::Ok().json(product)),
        None => {
            log::warn!("Product not found: {}", product_id);
            Err(InternalError::new("Product with provided ID not found.", StatusCode::NOT_FOUND).into())
        }
    }
}

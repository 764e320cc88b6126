mod callback;
mod catalog;
mod manual;
mod sales;
mod stk;

use actix_web::{HttpResponse, Responder, get, web};
pub use callback::*;
pub use catalog::*;
pub use manual::*;
pub use sales::*;
pub use stk::*;

#[get("/")]
pub async fn index() -> impl Responder {
    HttpResponse::Ok().body("Welcome to the M-Pesa POS service!")
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(get_products)
        .service(get_product_by_id)
        .service(initiate_stk)
        .service(list_stk)
        .service(get_stk_status)
        .service(mpesa_callback)
        .service(record_manual)
        .service(create_qr)
        .service(verify_qr)
        .service(get_manual_status)
        .service(finalize)
        .service(get_sales)
        .service(get_sale_by_id);
}

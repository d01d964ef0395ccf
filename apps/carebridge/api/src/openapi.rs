use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "CareBridge Notifications API"),
    nest((path = "/api/notifications", api = domain_notifications::ApiDoc))
)]
pub struct ApiDoc;

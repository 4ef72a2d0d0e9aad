use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{AuthService, AuthUser};
use crate::config::Config;
use crate::models::*;
use crate::store::{Store, StoreError};

pub struct AppState {
    pub store: Arc<Store>,
    pub auth_service: Arc<AuthService>,
    pub config: Arc<Config>,
}

/// Map a store error to its HTTP status. Internal errors are logged and
/// reported without detail.
fn error_response(e: StoreError) -> HttpResponse {
    match &e {
        StoreError::NotFound(_) => HttpResponse::NotFound().json(ApiResponse::<()>::error(e.to_string())),
        StoreError::NoAccessRights(_) | StoreError::DoesNotBelongToUser(_) => {
            HttpResponse::Forbidden().json(ApiResponse::<()>::error(e.to_string()))
        }
        StoreError::EntityInUse(_)
        | StoreError::PendingRequestExists
        | StoreError::FriendshipExists
        | StoreError::FriendRequestNotPending => {
            HttpResponse::Conflict().json(ApiResponse::<()>::error(e.to_string()))
        }
        StoreError::InvalidArgument(_) => {
            HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string()))
        }
        StoreError::Database(_) | StoreError::Json(_) | StoreError::Content(_) => {
            log::error!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Internal server error"))
        }
    }
}

fn respond<T: serde::Serialize>(result: Result<T, StoreError>) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Ok().json(ApiResponse::success(data)),
        Err(e) => error_response(e),
    }
}

fn respond_created<T: serde::Serialize>(result: Result<T, StoreError>) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Created().json(ApiResponse::success(data)),
        Err(e) => error_response(e),
    }
}

fn respond_no_content(result: Result<(), StoreError>) -> HttpResponse {
    match result {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(e),
    }
}

/// Run a store call on the blocking thread pool. Used for the reads and
/// updates that walk the friends-of-friends graph.
async fn respond_blocking<T, F>(f: F) -> HttpResponse
where
    T: serde::Serialize + Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match web::block(f).await {
        Ok(result) => respond(result),
        Err(e) => {
            log::error!("Blocking store call failed: {}", e);
            HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Internal server error"))
        }
    }
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ApiResponse::<()>::error(message))
}

/// Check `password` against the stored hash of `user_id`.
fn confirm_password(state: &AppState, user_id: &str, password: &str) -> Result<(), HttpResponse> {
    let user = state.store.get_user(user_id).map_err(error_response)?;
    if state.auth_service.verify_password(password, &user.password_hash) {
        Ok(())
    } else {
        Err(bad_request("Incorrect password"))
    }
}

#[derive(Deserialize)]
pub struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 100)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    fn page<T>(&self, items: Vec<T>) -> PaginatedResponse<T> {
        let (limit, offset) = (self.limit(), self.offset());
        PaginatedResponse {
            items: items
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect(),
            limit,
            offset,
        }
    }
}

// ==================== Health Check ====================

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

pub async fn info(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(ServerInfo {
        invite_required: state.config.invite_required(),
    }))
}

// ==================== Auth Endpoints ====================

pub async fn register(
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> impl Responder {
    if body.name.trim().is_empty() || body.email.trim().is_empty() || body.password.is_empty() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::error("Name, email and password are required"));
    }
    if !state.config.accepts_invite(body.invite_code.as_deref()) {
        return bad_request("Invalid invite code");
    }

    let password_hash = match state.auth_service.hash_password(&body.password) {
        Ok(hash) => hash,
        Err(_) => return HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Failed to hash password")),
    };

    let mut user = User {
        id: String::new(),
        name: body.name.trim().to_string(),
        email: body.email.trim().to_lowercase(),
        password_hash,
        is_admin: state.config.is_admin_email(&body.email),
        purge_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    if let Err(e) = state.store.create_user(&mut user) {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::error(format!("Failed to create user: {}", e)));
    }
    if user.is_admin {
        log::info!("Registered admin user {}", user.id);
    }

    let token = match state.auth_service.issue_token(&user.id) {
        Ok(t) => t,
        Err(e) => {
            log::error!("Failed to issue token for {}: {}", user.id, e);
            return HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Failed to generate token"));
        }
    };

    HttpResponse::Created().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn login(
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> impl Responder {
    let user = match state.store.get_user_by_email(&body.email.trim().to_lowercase()) {
        Ok(u) => u,
        Err(StoreError::NotFound(_)) => {
            return HttpResponse::Unauthorized().json(ApiResponse::<()>::error("Invalid credentials"));
        }
        Err(e) => return error_response(e),
    };

    if !state.auth_service.verify_password(&body.password, &user.password_hash) {
        return HttpResponse::Unauthorized().json(ApiResponse::<()>::error("Invalid credentials"));
    }

    let token = match state.auth_service.issue_token(&user.id) {
        Ok(t) => t,
        Err(e) => {
            log::error!("Failed to issue token for {}: {}", user.id, e);
            return HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Failed to generate token"));
        }
    };

    HttpResponse::Ok().json(ApiResponse::success(LoginResponse { token, user }))
}

pub async fn get_current_user(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.get_user(&auth_user.user_id))
}

pub async fn change_password(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<ChangePasswordRequest>,
) -> impl Responder {
    if body.new_password.is_empty() {
        return bad_request("New password must not be empty");
    }
    if let Err(response) = confirm_password(&state, &auth_user.user_id, &body.old_password) {
        return response;
    }

    let password_hash = match state.auth_service.hash_password(&body.new_password) {
        Ok(hash) => hash,
        Err(e) => {
            log::error!("Failed to hash password for {}: {}", auth_user.user_id, e);
            return HttpResponse::InternalServerError().json(ApiResponse::<()>::error("Failed to hash password"));
        }
    };
    respond_no_content(state.store.set_password_hash(&auth_user.user_id, &password_hash))
}

// ==================== User Endpoints ====================

pub async fn list_profiles(
    state: web::Data<AppState>,
    _auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.list_profiles())
}

pub async fn get_profile(
    state: web::Data<AppState>,
    _auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(state.store.get_profile(&path.into_inner()))
}

pub async fn update_profile(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<UpdateProfileRequest>,
) -> impl Responder {
    respond(state.store.update_profile(
        &auth_user.user_id,
        &body.full_name,
        &body.information,
        body.image_id.as_deref(),
    ))
}

pub async fn request_deletion(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<RequestDeletionRequest>,
) -> impl Responder {
    if let Err(response) = confirm_password(&state, &auth_user.user_id, &body.password) {
        return response;
    }
    respond(
        state
            .store
            .request_deletion(&auth_user.user_id, state.config.deletion_grace_period),
    )
}

pub async fn cancel_deletion(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.cancel_deletion(&auth_user.user_id))
}

// ==================== Things Endpoints ====================

pub async fn list_things(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    query: web::Query<PageQuery>,
) -> impl Responder {
    let store = state.store.clone();
    let query = query.into_inner();
    respond_blocking(move || {
        store
            .visible_things(&auth_user.user_id)
            .map(|things| query.page(things))
    })
    .await
}

pub async fn get_thing(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(state.store.get_thing_for(&auth_user.user_id, &path.into_inner()))
}

pub async fn create_thing(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<CreateThingRequest>,
) -> impl Responder {
    respond_created(state.store.create_thing(&auth_user.user_id, &body))
}

pub async fn update_thing(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<UpdateThingRequest>,
) -> impl Responder {
    respond(state.store.update_thing(&auth_user.user_id, &path.into_inner(), &body))
}

pub async fn delete_thing(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond_no_content(state.store.delete_thing(&auth_user.user_id, &path.into_inner()))
}

pub async fn thing_quantities(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(state.store.quantity_entries(&auth_user.user_id, &path.into_inner()))
}

pub async fn thing_shares(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let target = ShareTarget::Thing(path.into_inner());
    respond(state.store.shares_for_target(&auth_user.user_id, &target))
}

// ==================== Lists Endpoints ====================

pub async fn list_lists(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    query: web::Query<PageQuery>,
) -> impl Responder {
    let store = state.store.clone();
    let query = query.into_inner();
    respond_blocking(move || {
        store
            .visible_lists(&auth_user.user_id)
            .map(|lists| query.page(lists))
    })
    .await
}

pub async fn get_list(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(state.store.get_list_for(&auth_user.user_id, &path.into_inner()))
}

pub async fn create_list(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<CreateListRequest>,
) -> impl Responder {
    respond_created(state.store.create_list(&auth_user.user_id, &body))
}

pub async fn update_list(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<UpdateListRequest>,
) -> impl Responder {
    let store = state.store.clone();
    let (list_id, body) = (path.into_inner(), body.into_inner());
    respond_blocking(move || store.update_list(&auth_user.user_id, &list_id, &body)).await
}

pub async fn delete_list(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond_no_content(state.store.delete_list(&auth_user.user_id, &path.into_inner()))
}

pub async fn list_shares_of_list(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    let target = ShareTarget::List(path.into_inner());
    respond(state.store.shares_for_target(&auth_user.user_id, &target))
}

// ==================== Images Endpoints ====================

#[derive(Deserialize)]
pub struct UploadImageQuery {
    name: Option<String>,
}

pub async fn upload_image(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    req: HttpRequest,
    query: web::Query<UploadImageQuery>,
    body: web::Bytes,
) -> impl Responder {
    if body.is_empty() {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::error("Image body is empty"));
    }
    let mime = req
        .headers()
        .get("Content-Type")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("application/octet-stream");
    let name = query.name.clone().unwrap_or_default();

    respond_created(state.store.create_image(&auth_user.user_id, &name, mime, &body))
}

pub async fn get_image_content(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    match state.store.image_content(&auth_user.user_id, &path.into_inner()) {
        Ok((image, bytes)) => HttpResponse::Ok().content_type(image.mime).body(bytes),
        Err(e) => error_response(e),
    }
}

pub async fn delete_image(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond_no_content(state.store.delete_image(&auth_user.user_id, &path.into_inner()))
}

// ==================== Shares Endpoints ====================

pub async fn create_share(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<CreateShareRequest>,
) -> impl Responder {
    respond_created(
        state
            .store
            .create_share(&auth_user.user_id, &body.target_user_id, &body.target),
    )
}

pub async fn list_shares_given(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.shares_given(&auth_user.user_id))
}

pub async fn list_shares_received(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.shares_received(&auth_user.user_id))
}

pub async fn get_share(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(state.store.get_share(&auth_user.user_id, &path.into_inner()))
}

pub async fn delete_share(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond_no_content(state.store.delete_share(&auth_user.user_id, &path.into_inner()))
}

// ==================== Friends Endpoints ====================

pub async fn list_friend_requests(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.friend_requests(&auth_user.user_id))
}

pub async fn create_friend_request(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<CreateFriendRequestRequest>,
) -> impl Responder {
    respond_created(
        state
            .store
            .create_friend_request(&auth_user.user_id, &body.receiver_id),
    )
}

pub async fn accept_friend_request(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(
        state
            .store
            .react_friend_request(&auth_user.user_id, &path.into_inner(), true),
    )
}

pub async fn reject_friend_request(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(
        state
            .store
            .react_friend_request(&auth_user.user_id, &path.into_inner(), false),
    )
}

pub async fn cancel_friend_request(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond_no_content(
        state
            .store
            .cancel_friend_request(&auth_user.user_id, &path.into_inner()),
    )
}

pub async fn list_friends(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.friends(&auth_user.user_id))
}

pub async fn unfriend(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond_no_content(state.store.unfriend(&auth_user.user_id, &path.into_inner()))
}

// ==================== Cart Endpoints ====================

pub async fn get_cart(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(state.store.cart(&auth_user.user_id))
}

pub async fn update_cart(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    body: web::Json<UpdateCartRequest>,
) -> impl Responder {
    respond(state.store.update_cart(&auth_user.user_id, &body.thing_ids))
}

// ==================== Notifications Endpoints ====================

#[derive(Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    only_unacknowledged: bool,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list_notifications(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    query: web::Query<NotificationsQuery>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(50).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    respond(
        state
            .store
            .notifications(&auth_user.user_id, query.only_unacknowledged, limit, offset)
            .map(|items| PaginatedResponse { items, limit, offset }),
    )
}

pub async fn count_unacknowledged(
    state: web::Data<AppState>,
    auth_user: AuthUser,
) -> impl Responder {
    respond(
        state
            .store
            .count_unacknowledged(&auth_user.user_id)
            .map(|count| serde_json::json!({ "count": count })),
    )
}

pub async fn acknowledge_notification(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
) -> impl Responder {
    respond(
        state
            .store
            .acknowledge_notification(&auth_user.user_id, &path.into_inner()),
    )
}

// ==================== Search Endpoints ====================

#[derive(Deserialize)]
pub struct SearchQuery {
    query: String,
}

pub async fn search(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    query: web::Query<SearchQuery>,
) -> impl Responder {
    let store = state.store.clone();
    let query = query.into_inner().query;
    respond_blocking(move || store.search(&auth_user.user_id, &query)).await
}

#[derive(Deserialize)]
pub struct CompletionQuery {
    name: String,
    value: Option<String>,
}

pub async fn complete_property(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    query: web::Query<CompletionQuery>,
) -> impl Responder {
    let store = state.store.clone();
    let CompletionQuery { name, value } = query.into_inner();
    respond_blocking(move || store.complete_property(&auth_user.user_id, &name, value.as_deref())).await
}

// ==================== Admin Endpoints ====================

pub async fn schedule_purge(
    state: web::Data<AppState>,
    auth_user: AuthUser,
    path: web::Path<String>,
    body: web::Json<SchedulePurgeRequest>,
) -> impl Responder {
    match state.store.get_user(&auth_user.user_id) {
        Ok(caller) if caller.is_admin => {}
        Ok(_) => return HttpResponse::Forbidden().json(ApiResponse::<()>::error("Admin access required")),
        Err(e) => return error_response(e),
    }

    let user_id = path.into_inner();
    let Some(delay) = chrono::Duration::try_minutes(body.delay_minutes) else {
        return HttpResponse::BadRequest().json(ApiResponse::<()>::error("delay_minutes is out of range"));
    };
    match state.store.schedule_purge(&user_id, delay) {
        Ok(user) => {
            log::info!("Admin {} scheduled purge of {} at {:?}", auth_user.user_id, user_id, user.purge_at);
            HttpResponse::Ok().json(ApiResponse::success(user))
        }
        Err(e) => error_response(e),
    }
}

// ==================== Route Configuration ====================

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check
        .route("/health", web::get().to(health))
        .route("/api/info", web::get().to(info))

        // Auth routes (no auth required)
        .route("/api/auth/register", web::post().to(register))
        .route("/api/auth/login", web::post().to(login))
        .route("/api/auth/me", web::get().to(get_current_user))
        .route("/api/auth/password", web::put().to(change_password))

        // Users
        .route("/api/profiles", web::get().to(list_profiles))
        .route("/api/users/me/profile", web::put().to(update_profile))
        .route("/api/users/me/deletion", web::post().to(request_deletion))
        .route("/api/users/me/deletion", web::delete().to(cancel_deletion))
        .route("/api/users/{id}/profile", web::get().to(get_profile))

        // Things
        .route("/api/things", web::get().to(list_things))
        .route("/api/things", web::post().to(create_thing))
        .route("/api/things/{id}", web::get().to(get_thing))
        .route("/api/things/{id}", web::put().to(update_thing))
        .route("/api/things/{id}", web::delete().to(delete_thing))
        .route("/api/things/{id}/quantities", web::get().to(thing_quantities))
        .route("/api/things/{id}/shares", web::get().to(thing_shares))

        // Lists
        .route("/api/lists", web::get().to(list_lists))
        .route("/api/lists", web::post().to(create_list))
        .route("/api/lists/{id}", web::get().to(get_list))
        .route("/api/lists/{id}", web::put().to(update_list))
        .route("/api/lists/{id}", web::delete().to(delete_list))
        .route("/api/lists/{id}/shares", web::get().to(list_shares_of_list))

        // Images
        .route("/api/images", web::post().to(upload_image))
        .route("/api/images/{id}", web::get().to(get_image_content))
        .route("/api/images/{id}", web::delete().to(delete_image))

        // Shares
        .route("/api/shares", web::get().to(list_shares_given))
        .route("/api/shares", web::post().to(create_share))
        .route("/api/shares/received", web::get().to(list_shares_received))
        .route("/api/shares/{id}", web::get().to(get_share))
        .route("/api/shares/{id}", web::delete().to(delete_share))

        // Friends
        .route("/api/friend-requests", web::get().to(list_friend_requests))
        .route("/api/friend-requests", web::post().to(create_friend_request))
        .route("/api/friend-requests/{id}/accept", web::post().to(accept_friend_request))
        .route("/api/friend-requests/{id}/reject", web::post().to(reject_friend_request))
        .route("/api/friend-requests/{id}", web::delete().to(cancel_friend_request))
        .route("/api/friends", web::get().to(list_friends))
        .route("/api/friends/{id}", web::delete().to(unfriend))

        // Cart
        .route("/api/cart", web::get().to(get_cart))
        .route("/api/cart", web::put().to(update_cart))

        // Notifications
        .route("/api/notifications", web::get().to(list_notifications))
        .route("/api/notifications/unacknowledged-count", web::get().to(count_unacknowledged))
        .route("/api/notifications/{id}/acknowledge", web::post().to(acknowledge_notification))

        // Search
        .route("/api/search", web::get().to(search))
        .route("/api/search/property-completion", web::get().to(complete_property))

        // Admin
        .route("/api/admin/users/{id}/purge", web::post().to(schedule_purge));
}

//! # Catalog
//!
//! Products (meals and exercises) grouped into a tree of collections.
//!
//! ## Access codes
//! A collection may require an access code. Entering the right code stores a
//! grant `(collectionId, grantedAt)` for the user. Changing the code moves the
//! collection's `codeUpdatedAt` forward, which invalidates every grant issued
//! before it; the timestamp works as a logical clock for code rotation.
//!
//! Administrators and the owner of a collection are never asked for a code.
//! A sub-collection is only reachable when all of its ancestors are.
use std::collections::HashSet;
use std::sync::Arc;

use axum::{Extension, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::AppError;
use crate::extract::{Json, Path, Query};
use crate::login::{CurrentUser, hash_password, verify_password};
use crate::nutrition::Nutrition;
use crate::store::{COLLECTIONS_FILE, GRANTS_FILE, PRODUCTS_FILE, Store};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Meal,
    Exercise,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub kind: ProductKind,
    #[serde(default)]
    pub description: Option<String>,
    /// Per serving
    #[serde(default)]
    pub nutrition: Nutrition,
    #[serde(default)]
    pub collection_ids: Vec<Uuid>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub owner: String,
    #[serde(default)]
    pub requires_code: bool,
    #[serde(default)]
    pub access_code_hash: Option<String>,
    #[serde(default)]
    pub code_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub collection_id: Uuid,
    pub granted_at: DateTime<Utc>,
}

/// Collection as returned to clients: no code hash, plus whether the caller
/// still needs a code to open it.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CollectionView {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub owner: String,
    pub requires_code: bool,
    pub code_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub locked: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CollectionDetail {
    pub collection: CollectionView,
    pub children: Vec<CollectionView>,
    pub products: Vec<Product>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCollection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub access_code: Option<String>,
}

/// Partial update. `accessCode` set to a non-empty string rotates the code,
/// set to an empty string removes the requirement.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CollectionUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub access_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccessRequest {
    pub code: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CollectionQuery {
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    pub kind: ProductKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nutrition: Nutrition,
    #[serde(default)]
    pub collection_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuery {
    #[serde(default)]
    pub collection: Option<Uuid>,
    #[serde(default)]
    pub kind: Option<ProductKind>,
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Granted,
    CodeRequired,
}

/// Gate for a single collection, ignoring its ancestors.
pub fn check_access(
    collection: &Collection,
    user: &CurrentUser,
    grant: Option<&AccessGrant>,
) -> Access {
    if user.is_admin() || collection.owner == user.username || !collection.requires_code {
        return Access::Granted;
    }

    match (grant, collection.code_updated_at) {
        (Some(grant), Some(updated)) if grant.granted_at >= updated => Access::Granted,
        (Some(_), None) => Access::Granted,
        _ => Access::CodeRequired,
    }
}

/// Everything needed to answer access questions for one user.
pub struct AccessContext {
    pub user: CurrentUser,
    pub collections: Vec<Collection>,
    pub grants: Vec<AccessGrant>,
}

impl AccessContext {
    pub fn load(store: &Store, user: &CurrentUser) -> Result<Self, AppError> {
        Ok(Self {
            user: user.clone(),
            collections: store.read(COLLECTIONS_FILE)?,
            grants: store.read(&Store::user_file(&user.username, GRANTS_FILE))?,
        })
    }

    pub fn collection(&self, id: Uuid) -> Option<&Collection> {
        self.collections.iter().find(|c| c.id == id)
    }

    fn grant(&self, id: Uuid) -> Option<&AccessGrant> {
        self.grants.iter().find(|g| g.collection_id == id)
    }

    /// Walks from `id` to the root. Fails with the id of the first locked
    /// collection on the way so the client knows which code to ask for.
    pub fn check(&self, id: Uuid) -> Result<(), AppError> {
        if self.collection(id).is_none() {
            return Err(AppError::NotFound("Collection"));
        }

        let mut visited = HashSet::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            if !visited.insert(cid) {
                break;
            }
            let Some(collection) = self.collection(cid) else {
                break;
            };
            if check_access(collection, &self.user, self.grant(cid)) == Access::CodeRequired {
                return Err(AppError::AccessCodeRequired(cid));
            }
            current = collection.parent_id;
        }

        Ok(())
    }

    pub fn is_locked(&self, id: Uuid) -> bool {
        self.check(id).is_err()
    }

    /// Products outside every collection are public. Otherwise one reachable
    /// collection is enough.
    pub fn product_visible(&self, product: &Product) -> bool {
        product.collection_ids.is_empty()
            || product.collection_ids.iter().any(|id| self.check(*id).is_ok())
    }

    pub fn view(&self, collection: &Collection) -> CollectionView {
        CollectionView {
            id: collection.id,
            name: collection.name.clone(),
            description: collection.description.clone(),
            parent_id: collection.parent_id,
            owner: collection.owner.clone(),
            requires_code: collection.requires_code,
            code_updated_at: collection.code_updated_at,
            created_at: collection.created_at,
            locked: self.is_locked(collection.id),
        }
    }

    fn can_manage(&self, collection: &Collection) -> bool {
        self.user.is_admin() || collection.owner == self.user.username
    }
}

fn normalized_code(code: Option<String>) -> Option<String> {
    code.map(|c| c.trim().to_string())
}

pub fn list_collections(
    store: &Store,
    user: &CurrentUser,
    parent_id: Option<Uuid>,
) -> Result<Vec<CollectionView>, AppError> {
    let ctx = AccessContext::load(store, user)?;
    if let Some(parent) = parent_id {
        ctx.check(parent)?;
    }

    Ok(ctx
        .collections
        .iter()
        .filter(|c| c.parent_id == parent_id)
        .map(|c| ctx.view(c))
        .collect())
}

pub fn get_collection(
    store: &Store,
    user: &CurrentUser,
    id: Uuid,
) -> Result<CollectionDetail, AppError> {
    let ctx = AccessContext::load(store, user)?;
    ctx.check(id)?;

    let collection = ctx.collection(id).ok_or(AppError::NotFound("Collection"))?;
    let products: Vec<Product> = store.read(PRODUCTS_FILE)?;

    Ok(CollectionDetail {
        collection: ctx.view(collection),
        children: ctx
            .collections
            .iter()
            .filter(|c| c.parent_id == Some(id))
            .map(|c| ctx.view(c))
            .collect(),
        products: products
            .into_iter()
            .filter(|p| p.collection_ids.contains(&id))
            .collect(),
    })
}

pub fn create_collection(
    store: &Store,
    user: &CurrentUser,
    new: NewCollection,
) -> Result<Collection, AppError> {
    if new.name.trim().is_empty() {
        return Err(AppError::bad_request("Collection name is required"));
    }

    if let Some(parent_id) = new.parent_id {
        let ctx = AccessContext::load(store, user)?;
        let parent = ctx
            .collection(parent_id)
            .ok_or(AppError::NotFound("Parent collection"))?;
        if !ctx.can_manage(parent) {
            return Err(AppError::forbidden(
                "Only the owner can add sub-collections",
            ));
        }
    }

    let code = normalized_code(new.access_code).filter(|c| !c.is_empty());
    let now = Utc::now();
    let collection = Collection {
        id: Uuid::new_v4(),
        name: new.name.trim().to_string(),
        description: new.description,
        parent_id: new.parent_id,
        owner: user.username.clone(),
        requires_code: code.is_some(),
        access_code_hash: code.as_deref().map(hash_password).transpose()?,
        code_updated_at: code.as_ref().map(|_| now),
        created_at: now,
    };

    store.update(COLLECTIONS_FILE, |collections: &mut Vec<Collection>| {
        collections.push(collection.clone());
        Ok(())
    })?;

    info!("{} created collection {}", user.username, collection.id);
    Ok(collection)
}

pub fn update_collection(
    store: &Store,
    user: &CurrentUser,
    id: Uuid,
    update: CollectionUpdate,
) -> Result<Collection, AppError> {
    let new_hash = match normalized_code(update.access_code) {
        Some(code) if !code.is_empty() => Some(Some(hash_password(&code)?)),
        Some(_) => Some(None),
        None => None,
    };

    store.update(COLLECTIONS_FILE, |collections: &mut Vec<Collection>| {
        let collection = collections
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(AppError::NotFound("Collection"))?;
        if !user.is_admin() && collection.owner != user.username {
            return Err(AppError::forbidden("Only the owner can edit this collection"));
        }

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(AppError::bad_request("Collection name is required"));
            }
            collection.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            collection.description = Some(description);
        }
        if let Some(hash) = new_hash {
            collection.requires_code = hash.is_some();
            collection.access_code_hash = hash;
            collection.code_updated_at = Some(Utc::now());
        }

        Ok(collection.clone())
    })
}

/// Deletes an empty collection and detaches it from its products.
pub fn delete_collection(store: &Store, user: &CurrentUser, id: Uuid) -> Result<(), AppError> {
    store.update(COLLECTIONS_FILE, |collections: &mut Vec<Collection>| {
        let collection = collections
            .iter()
            .find(|c| c.id == id)
            .ok_or(AppError::NotFound("Collection"))?;
        if !user.is_admin() && collection.owner != user.username {
            return Err(AppError::forbidden("Only the owner can delete this collection"));
        }
        if collections.iter().any(|c| c.parent_id == Some(id)) {
            return Err(AppError::Conflict(
                "Collection still has sub-collections".to_string(),
            ));
        }

        collections.retain(|c| c.id != id);
        Ok(())
    })?;

    store.update(PRODUCTS_FILE, |products: &mut Vec<Product>| {
        for product in products.iter_mut() {
            product.collection_ids.retain(|cid| *cid != id);
        }
        Ok(())
    })
}

/// Checks an access code and records a grant for the user.
///
/// # Arguments
/// * `store` - Data directory holding collections and per-user grants
/// * `user` - User unlocking the collection
/// * `id` - Collection to unlock
/// * `code` - Code as typed, surrounding whitespace ignored
///
/// # Returns
/// The grant. It stays valid until the collection's code is rotated.
///
/// # Errors
/// * `NotFound` for an unknown collection
/// * `Forbidden` when the code does not match
pub fn grant_access(
    store: &Store,
    user: &CurrentUser,
    id: Uuid,
    code: &str,
) -> Result<AccessGrant, AppError> {
    let collections: Vec<Collection> = store.read(COLLECTIONS_FILE)?;
    let collection = collections
        .iter()
        .find(|c| c.id == id)
        .ok_or(AppError::NotFound("Collection"))?;

    let grant = AccessGrant {
        collection_id: id,
        granted_at: Utc::now(),
    };
    if !collection.requires_code {
        return Ok(grant);
    }

    let hash = collection
        .access_code_hash
        .as_deref()
        .ok_or_else(|| AppError::internal("Collection has no access code set"))?;
    if !verify_password(code.trim(), hash)? {
        return Err(AppError::forbidden("Invalid access code"));
    }

    store.update(
        &Store::user_file(&user.username, GRANTS_FILE),
        |grants: &mut Vec<AccessGrant>| {
            grants.retain(|g| g.collection_id != id);
            grants.push(grant.clone());
            Ok(())
        },
    )?;

    info!("{} unlocked collection {id}", user.username);
    Ok(grant)
}

pub fn list_products(
    store: &Store,
    user: &CurrentUser,
    query: &ProductQuery,
) -> Result<Vec<Product>, AppError> {
    let ctx = AccessContext::load(store, user)?;
    if let Some(collection) = query.collection {
        ctx.check(collection)?;
    }

    let search = query.search.as_ref().map(|s| s.to_lowercase());
    let products: Vec<Product> = store.read(PRODUCTS_FILE)?;

    Ok(products
        .into_iter()
        .filter(|p| query.collection.is_none_or(|c| p.collection_ids.contains(&c)))
        .filter(|p| query.kind.is_none_or(|k| p.kind == k))
        .filter(|p| {
            search
                .as_ref()
                .is_none_or(|s| p.name.to_lowercase().contains(s.as_str()))
        })
        .filter(|p| ctx.product_visible(p))
        .collect())
}

/// Looks up a product the user is allowed to see.
pub fn find_visible_product(
    store: &Store,
    user: &CurrentUser,
    id: Uuid,
) -> Result<Product, AppError> {
    let products: Vec<Product> = store.read(PRODUCTS_FILE)?;
    let product = products
        .into_iter()
        .find(|p| p.id == id)
        .ok_or(AppError::NotFound("Product"))?;

    let ctx = AccessContext::load(store, user)?;
    if ctx.product_visible(&product) {
        return Ok(product);
    }

    // report the first locked collection so the client can prompt for its code
    match product.collection_ids.iter().find_map(|cid| ctx.check(*cid).err()) {
        Some(err) => Err(err),
        None => Err(AppError::NotFound("Product")),
    }
}

fn validate_product(store: &Store, user: &CurrentUser, new: &NewProduct) -> Result<(), AppError> {
    // products outside every collection are public
    if new.collection_ids.is_empty() {
        user.require_admin()?;
    }
    if new.name.trim().is_empty() {
        return Err(AppError::bad_request("Product name is required"));
    }
    if !new.nutrition.is_valid() {
        return Err(AppError::bad_request("Nutrition values must be non-negative"));
    }

    let ctx = AccessContext::load(store, user)?;
    for id in &new.collection_ids {
        let collection = ctx.collection(*id).ok_or(AppError::NotFound("Collection"))?;
        if !ctx.can_manage(collection) {
            return Err(AppError::forbidden(format!(
                "You cannot add products to collection {}",
                collection.name
            )));
        }
    }

    Ok(())
}

pub fn create_product(
    store: &Store,
    user: &CurrentUser,
    new: NewProduct,
) -> Result<Product, AppError> {
    validate_product(store, user, &new)?;

    let product = Product {
        id: Uuid::new_v4(),
        name: new.name.trim().to_string(),
        kind: new.kind,
        description: new.description,
        nutrition: new.nutrition,
        collection_ids: new.collection_ids,
        created_by: user.username.clone(),
        created_at: Utc::now(),
    };

    store.update(PRODUCTS_FILE, |products: &mut Vec<Product>| {
        products.push(product.clone());
        Ok(())
    })?;

    Ok(product)
}

/// Replaces a product's fields.
///
/// # Arguments
/// * `user` - Must be the product's creator or an admin
/// * `id` - Product to edit
/// * `new` - Full replacement, validated like a new product
///
/// # Errors
/// * `Forbidden` when the caller did not create the product, cannot manage
///   one of the target collections, or is not an admin and `collectionIds`
///   is empty
/// * `NotFound` when the product or a target collection does not exist
pub fn update_product(
    store: &Store,
    user: &CurrentUser,
    id: Uuid,
    new: NewProduct,
) -> Result<Product, AppError> {
    validate_product(store, user, &new)?;

    store.update(PRODUCTS_FILE, |products: &mut Vec<Product>| {
        let product = products
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(AppError::NotFound("Product"))?;
        if !user.is_admin() && product.created_by != user.username {
            return Err(AppError::forbidden("Only the creator can edit this product"));
        }

        product.name = new.name.trim().to_string();
        product.kind = new.kind;
        product.description = new.description;
        product.nutrition = new.nutrition;
        product.collection_ids = new.collection_ids;
        Ok(product.clone())
    })
}

pub fn delete_product(store: &Store, user: &CurrentUser, id: Uuid) -> Result<(), AppError> {
    store.update(PRODUCTS_FILE, |products: &mut Vec<Product>| {
        let product = products
            .iter()
            .find(|p| p.id == id)
            .ok_or(AppError::NotFound("Product"))?;
        if !user.is_admin() && product.created_by != user.username {
            return Err(AppError::forbidden("Only the creator can delete this product"));
        }

        products.retain(|p| p.id != id);
        Ok(())
    })
}

pub async fn handle_list_collections(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<CollectionQuery>,
) -> Result<Json<Vec<CollectionView>>, AppError> {
    Ok(Json(list_collections(&state.store, &user, query.parent_id)?))
}

pub async fn handle_get_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<CollectionDetail>, AppError> {
    Ok(Json(get_collection(&state.store, &user, id)?))
}

pub async fn handle_create_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(new): Json<NewCollection>,
) -> Result<Json<CollectionView>, AppError> {
    let collection = create_collection(&state.store, &user, new)?;
    let ctx = AccessContext::load(&state.store, &user)?;
    Ok(Json(ctx.view(&collection)))
}

pub async fn handle_update_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(update): Json<CollectionUpdate>,
) -> Result<Json<CollectionView>, AppError> {
    let collection = update_collection(&state.store, &user, id, update)?;
    let ctx = AccessContext::load(&state.store, &user)?;
    Ok(Json(ctx.view(&collection)))
}

pub async fn handle_delete_collection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    delete_collection(&state.store, &user, id)?;
    Ok(Json(serde_json::json!({ "message": "Collection deleted" })))
}

pub async fn handle_grant_access(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<AccessRequest>,
) -> Result<Json<AccessGrant>, AppError> {
    Ok(Json(grant_access(&state.store, &user, id, &request.code)?))
}

pub async fn handle_list_products(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ProductQuery>,
) -> Result<Json<Vec<Product>>, AppError> {
    Ok(Json(list_products(&state.store, &user, &query)?))
}

pub async fn handle_get_product(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Product>, AppError> {
    Ok(Json(find_visible_product(&state.store, &user, id)?))
}

pub async fn handle_create_product(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Json(new): Json<NewProduct>,
) -> Result<Json<Product>, AppError> {
    Ok(Json(create_product(&state.store, &user, new)?))
}

pub async fn handle_update_product(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(new): Json<NewProduct>,
) -> Result<Json<Product>, AppError> {
    Ok(Json(update_product(&state.store, &user, id, new)?))
}

pub async fn handle_delete_product(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    delete_product(&state.store, &user, id)?;
    Ok(Json(serde_json::json!({ "message": "Product deleted" })))
}

//! Audience resolution
//!
//! Maps a content item's visibility to protocol `to`/`cc` address
//! lists and infers visibility back from inbound audience fields.
//! Inference runs before persistence since visibility is immutable
//! once an object is stored.

use crate::data::Visibility;

/// The ActivityStreams public collection.
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Aliases peers use for the public collection.
fn is_public_collection(uri: &str) -> bool {
    uri == PUBLIC_COLLECTION || uri == "as:Public" || uri == "Public"
}

fn is_followers_collection(uri: &str) -> bool {
    uri.ends_with("/followers")
}

/// Compute `to`/`cc` for an outbound object or activity.
///
/// | visibility | to | cc |
/// |---|---|---|
/// | public | public collection | followers |
/// | unlisted | followers | public collection |
/// | followers | followers | - |
/// | direct | - (explicit recipients carried separately) | - |
pub fn resolve_audience(visibility: Visibility, actor_uri: &str) -> (Vec<String>, Vec<String>) {
    let followers = format!("{}/followers", actor_uri);

    match visibility {
        Visibility::Public => (vec![PUBLIC_COLLECTION.to_string()], vec![followers]),
        Visibility::Unlisted => (vec![followers], vec![PUBLIC_COLLECTION.to_string()]),
        Visibility::Followers => (vec![followers], Vec::new()),
        Visibility::Direct => (Vec::new(), Vec::new()),
    }
}

/// Infer visibility from the audience fields of a received object.
///
/// Public wins if the public collection is addressed directly; a
/// public collection only in `cc` means unlisted; a recipient list
/// made up entirely of mention targets and followers collections with
/// at least one mention is direct; everything else is followers-only.
pub fn infer_visibility(to: &[String], cc: &[String], mention_uris: &[String]) -> Visibility {
    if to.iter().any(|uri| is_public_collection(uri)) {
        return Visibility::Public;
    }

    if cc.iter().any(|uri| is_public_collection(uri)) {
        return Visibility::Unlisted;
    }

    let all_known = to.iter().chain(cc.iter()).all(|uri| {
        is_followers_collection(uri) || mention_uris.iter().any(|mention| mention == uri)
    });
    if all_known && !mention_uris.is_empty() {
        return Visibility::Direct;
    }

    Visibility::Followers
}

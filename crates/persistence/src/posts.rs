//! Post repository: posts, comments and the post/tag association, with
//! the eager-loading, join and aggregate reads built on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CommentId, PostId, UserId};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::model::{Comment, NewComment, NewPost, NewTag, Post, PostTag, Tag, User};
use crate::users::Page;

/// A comment with its author loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentWithAuthor {
    pub comment: Comment,
    pub author: User,
}

/// A post with author, tags and live comments (each with its author).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDetails {
    pub post: Post,
    pub author: User,
    /// In tag id order.
    pub tags: Vec<Tag>,
    /// Oldest first.
    pub comments: Vec<CommentWithAuthor>,
}

/// A post with its live comments, newest comment first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostWithComments {
    pub post: Post,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostWithAuthor {
    pub post: Post,
    pub author: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularPost {
    pub post: Post,
    /// Live comments on the post.
    pub comment_count: i64,
}

/// The few columns a post listing needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: PostId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub user_name: String,
}

/// Persistence for posts and their associations.
///
/// Soft-deleted posts and comments are invisible to every read. Reads that
/// join or load authors skip posts and comments whose author is
/// soft-deleted.
///
/// Tags are matched by slug: attaching a [`NewTag`] whose slug exists
/// reuses that tag, otherwise the tag is created. A new tag whose name is
/// taken under another slug fails with `DuplicateTagName`.
#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Inserts a post and attaches `tags` in one transaction. The author is
    /// recorded as having added each tag.
    async fn create_post(&self, post: NewPost, tags: Vec<NewTag>) -> Result<Post>;

    async fn find_post(&self, id: PostId) -> Result<Post>;

    /// Live replies to `parent`, oldest first.
    async fn replies(&self, parent: PostId) -> Result<Vec<Post>>;

    /// Soft delete.
    async fn delete_post(&self, id: PostId) -> Result<()>;

    /// Fails with `NotFound` when the post or the author is absent.
    async fn add_comment(&self, comment: NewComment) -> Result<Comment>;

    /// Soft delete.
    async fn delete_comment(&self, id: CommentId) -> Result<()>;

    /// Tags attached to a live post, in tag id order.
    async fn tags(&self, post: PostId) -> Result<Vec<Tag>>;

    /// Join-table rows of a live post, in tag id order.
    async fn tag_links(&self, post: PostId) -> Result<Vec<PostTag>>;

    /// Attaches `tags`, keeping the ones already attached.
    async fn append_tags(
        &self,
        post: PostId,
        tags: Vec<NewTag>,
        added_by: Option<UserId>,
    ) -> Result<()>;

    /// Detaches every tag, then attaches `tags`, in one transaction. Tags
    /// themselves are never deleted.
    async fn replace_tags(
        &self,
        post: PostId,
        tags: Vec<NewTag>,
        added_by: Option<UserId>,
    ) -> Result<()>;

    /// Detaches the tag with `slug`. Returns whether it was attached.
    async fn remove_tag(&self, post: PostId, slug: &str) -> Result<bool>;

    /// Detaches every tag. Returns how many were attached.
    async fn clear_tags(&self, post: PostId) -> Result<u64>;

    async fn count_tags(&self, post: PostId) -> Result<i64>;

    /// Newest first, with author, tags and commenters preloaded in one query
    /// per association.
    async fn find_posts_with_details(&self, page: Page) -> Result<Vec<PostDetails>>;

    /// Every live post in id order, with live comments newest first.
    async fn find_posts_with_active_comments(&self) -> Result<Vec<PostWithComments>>;

    /// Posts whose author has `email`, in id order.
    async fn find_posts_by_user_email(&self, email: &str) -> Result<Vec<Post>>;

    /// Posts with their authors, in id order.
    async fn find_posts_with_user(&self) -> Result<Vec<PostWithAuthor>>;

    /// Posts with at least `min_comments` live comments, most commented
    /// first; ties in id order.
    async fn find_popular_posts(&self, min_comments: i64) -> Result<Vec<PopularPost>>;

    /// Id, title, creation time and author username of each post, in id
    /// order.
    async fn find_post_summaries(&self) -> Result<Vec<PostSummary>>;
}

/// Drops repeated slugs, keeping the first occurrence.
pub(crate) fn dedup_by_slug(tags: Vec<NewTag>) -> Vec<NewTag> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .filter(|tag| seen.insert(tag.slug.clone()))
        .collect()
}

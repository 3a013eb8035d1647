use std::collections::HashMap;

use async_trait::async_trait;
use common::{CommentId, PostId, TagId, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::PgScope;
use crate::model::{
    Comment, FK_POST_TAGS_ADDED_BY, NewComment, NewPost, NewTag, Post, PostTag, Tag, User,
};
use crate::posts::{
    CommentWithAuthor, PopularPost, PostDetails, PostRepository, PostSummary, PostWithAuthor,
    PostWithComments, dedup_by_slug,
};
use crate::record::{Reference, missing_reference};
use crate::users::Page;
use crate::{Record, Result, Scope, StoreError, Table};

/// PostgreSQL-backed post repository.
///
/// Associations are preloaded with one `= ANY($1)` query per association
/// rather than one query per post.
#[derive(Clone)]
pub struct PostgresPostRepository {
    pool: PgPool,
}

fn rows_to<R: Record>(rows: &[PgRow]) -> Result<Vec<R>> {
    Ok(rows
        .iter()
        .map(R::from_row)
        .collect::<std::result::Result<_, _>>()?)
}

fn post_tag_from_row(row: &PgRow) -> std::result::Result<PostTag, sqlx::Error> {
    Ok(PostTag {
        post_id: PostId::new(row.try_get("post_id")?),
        tag_id: TagId::new(row.try_get("tag_id")?),
        added_by: row.try_get::<Option<i64>, _>("added_by")?.map(UserId::new),
        created_at: row.try_get("created_at")?,
    })
}

fn post_ids(posts: &[Post]) -> Vec<i64> {
    posts.iter().map(|p| p.id.as_i64()).collect()
}

impl PostgresPostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<PgScope> {
        let tx = self.pool.begin().await?;
        Ok(PgScope { tx, depth: 0 })
    }

    async fn ensure_live(&self, post: PostId) -> Result<()> {
        sqlx::query("SELECT 1 FROM posts WHERE id = $1 AND deleted_at IS NULL")
            .bind(post.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(Table::Posts, post))
    }

    /// Live users with these ids, by id.
    async fn users_by_id(&self, ids: Vec<i64>) -> Result<HashMap<UserId, User>> {
        let rows = sqlx::query("SELECT * FROM users WHERE id = ANY($1) AND deleted_at IS NULL")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows_to::<User>(&rows)?
            .into_iter()
            .map(|u| (u.id, u))
            .collect())
    }

    /// Tags of each post, in tag id order.
    async fn tags_by_post(&self, posts: Vec<i64>) -> Result<HashMap<PostId, Vec<Tag>>> {
        let rows = sqlx::query(
            "SELECT pt.post_id, t.* FROM post_tags pt \
             JOIN tags t ON t.id = pt.tag_id \
             WHERE pt.post_id = ANY($1) ORDER BY t.id",
        )
        .bind(posts)
        .fetch_all(&self.pool)
        .await?;

        let mut tags: HashMap<PostId, Vec<Tag>> = HashMap::new();
        for row in &rows {
            let post = PostId::new(row.try_get("post_id")?);
            tags.entry(post).or_default().push(Tag::from_row(row)?);
        }
        Ok(tags)
    }

    /// Live comments of each post, in the order `order_by` gives.
    async fn comments_by_post(
        &self,
        posts: Vec<i64>,
        order_by: &str,
    ) -> Result<HashMap<PostId, Vec<Comment>>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM comments WHERE post_id = ANY($1) AND deleted_at IS NULL \
             ORDER BY {order_by}"
        ))
        .bind(posts)
        .fetch_all(&self.pool)
        .await?;

        let mut comments: HashMap<PostId, Vec<Comment>> = HashMap::new();
        for comment in rows_to::<Comment>(&rows)? {
            comments.entry(comment.post_id).or_default().push(comment);
        }
        Ok(comments)
    }

    /// Live posts whose author is live, in the order `order_by` gives.
    async fn posts_with_live_authors(
        &self,
        order_by: &str,
        page: Option<Page>,
    ) -> Result<Vec<Post>> {
        let mut sql = format!(
            "SELECT p.* FROM posts p \
             JOIN users u ON u.id = p.user_id AND u.deleted_at IS NULL \
             WHERE p.deleted_at IS NULL ORDER BY {order_by}"
        );
        if page.is_some() {
            sql.push_str(" LIMIT $1 OFFSET $2");
        }
        let mut query = sqlx::query(&sql);
        if let Some(page) = page {
            query = query.bind(page.limit()).bind(page.offset());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows_to(&rows)
    }
}

/// Links `tags` to `post`, creating tags whose slug is new.
async fn attach(
    scope: &mut PgScope,
    post: PostId,
    tags: Vec<NewTag>,
    added_by: Option<UserId>,
) -> Result<()> {
    let references: Vec<Reference> = added_by
        .map(|user| Reference::new(FK_POST_TAGS_ADDED_BY, Table::Users, user))
        .into_iter()
        .collect();

    for tag in dedup_by_slug(tags) {
        let row = sqlx::query(
            "INSERT INTO tags (name, slug) VALUES ($1, $2) \
             ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug RETURNING *",
        )
        .bind(&tag.name)
        .bind(&tag.slug)
        .fetch_one(&mut *scope.tx)
        .await?;
        let tag = Tag::from_row(&row)?;

        sqlx::query(
            "INSERT INTO post_tags (post_id, tag_id, added_by) VALUES ($1, $2, $3) \
             ON CONFLICT (post_id, tag_id) DO NOTHING",
        )
        .bind(post.as_i64())
        .bind(tag.id.as_i64())
        .bind(added_by.map(|u| u.as_i64()))
        .execute(&mut *scope.tx)
        .await
        .map_err(|err| missing_reference(&references, &err).unwrap_or_else(|| err.into()))?;
    }
    Ok(())
}

async fn detach_all(scope: &mut PgScope, post: PostId) -> Result<u64> {
    let result = sqlx::query("DELETE FROM post_tags WHERE post_id = $1")
        .bind(post.as_i64())
        .execute(&mut *scope.tx)
        .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl PostRepository for PostgresPostRepository {
    #[tracing::instrument(skip(self, post, tags), fields(user_id = %post.user_id))]
    async fn create_post(&self, post: NewPost, tags: Vec<NewTag>) -> Result<Post> {
        let mut scope = self.begin().await?;
        let created = scope.insert(post).await?;
        attach(&mut scope, created.id, tags, Some(created.user_id)).await?;
        scope.commit().await?;
        Ok(created)
    }

    async fn find_post(&self, id: PostId) -> Result<Post> {
        let row = sqlx::query("SELECT * FROM posts WHERE id = $1 AND deleted_at IS NULL")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(Table::Posts, id))?;
        Ok(Post::from_row(&row)?)
    }

    async fn replies(&self, parent: PostId) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT * FROM posts WHERE parent_id = $1 AND deleted_at IS NULL ORDER BY id",
        )
        .bind(parent.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows_to(&rows)
    }

    async fn delete_post(&self, id: PostId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE posts SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(Table::Posts, id));
        }
        Ok(())
    }

    async fn add_comment(&self, comment: NewComment) -> Result<Comment> {
        let mut scope = self.begin().await?;
        scope.lock_for_update::<Post>(comment.post_id.as_i64()).await?;
        let created = scope.insert(comment).await?;
        scope.commit().await?;
        Ok(created)
    }

    async fn delete_comment(&self, id: CommentId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE comments SET deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(Table::Comments, id));
        }
        Ok(())
    }

    async fn tags(&self, post: PostId) -> Result<Vec<Tag>> {
        self.ensure_live(post).await?;
        Ok(self
            .tags_by_post(vec![post.as_i64()])
            .await?
            .remove(&post)
            .unwrap_or_default())
    }

    async fn tag_links(&self, post: PostId) -> Result<Vec<PostTag>> {
        self.ensure_live(post).await?;
        let rows = sqlx::query("SELECT * FROM post_tags WHERE post_id = $1 ORDER BY tag_id")
            .bind(post.as_i64())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(post_tag_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn append_tags(
        &self,
        post: PostId,
        tags: Vec<NewTag>,
        added_by: Option<UserId>,
    ) -> Result<()> {
        let mut scope = self.begin().await?;
        scope.lock_for_update::<Post>(post.as_i64()).await?;
        attach(&mut scope, post, tags, added_by).await?;
        scope.commit().await
    }

    async fn replace_tags(
        &self,
        post: PostId,
        tags: Vec<NewTag>,
        added_by: Option<UserId>,
    ) -> Result<()> {
        let mut scope = self.begin().await?;
        scope.lock_for_update::<Post>(post.as_i64()).await?;
        detach_all(&mut scope, post).await?;
        attach(&mut scope, post, tags, added_by).await?;
        scope.commit().await
    }

    async fn remove_tag(&self, post: PostId, slug: &str) -> Result<bool> {
        let mut scope = self.begin().await?;
        scope.lock_for_update::<Post>(post.as_i64()).await?;
        let result = sqlx::query(
            "DELETE FROM post_tags pt USING tags t \
             WHERE pt.tag_id = t.id AND pt.post_id = $1 AND t.slug = $2",
        )
        .bind(post.as_i64())
        .bind(slug)
        .execute(&mut *scope.tx)
        .await?;
        scope.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_tags(&self, post: PostId) -> Result<u64> {
        let mut scope = self.begin().await?;
        scope.lock_for_update::<Post>(post.as_i64()).await?;
        let removed = detach_all(&mut scope, post).await?;
        scope.commit().await?;
        Ok(removed)
    }

    async fn count_tags(&self, post: PostId) -> Result<i64> {
        self.ensure_live(post).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_tags WHERE post_id = $1")
            .bind(post.as_i64())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn find_posts_with_details(&self, page: Page) -> Result<Vec<PostDetails>> {
        let posts = self
            .posts_with_live_authors("p.created_at DESC, p.id DESC", Some(page))
            .await?;
        if posts.is_empty() {
            return Ok(Vec::new());
        }
        let ids = post_ids(&posts);

        let mut tags = self.tags_by_post(ids.clone()).await?;
        let mut comments = self.comments_by_post(ids, "id ASC").await?;
        let mut user_ids: Vec<i64> = posts.iter().map(|p| p.user_id.as_i64()).collect();
        user_ids.extend(comments.values().flatten().map(|c| c.user_id.as_i64()));
        user_ids.sort_unstable();
        user_ids.dedup();
        let users = self.users_by_id(user_ids).await?;

        Ok(posts
            .into_iter()
            .filter_map(|post| {
                let author = users.get(&post.user_id)?.clone();
                let comments = comments
                    .remove(&post.id)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|comment| {
                        let author = users.get(&comment.user_id)?.clone();
                        Some(CommentWithAuthor { comment, author })
                    })
                    .collect();
                Some(PostDetails {
                    tags: tags.remove(&post.id).unwrap_or_default(),
                    post,
                    author,
                    comments,
                })
            })
            .collect())
    }

    async fn find_posts_with_active_comments(&self) -> Result<Vec<PostWithComments>> {
        let rows = sqlx::query("SELECT * FROM posts WHERE deleted_at IS NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let posts: Vec<Post> = rows_to(&rows)?;
        let mut comments = self
            .comments_by_post(post_ids(&posts), "created_at DESC, id DESC")
            .await?;

        Ok(posts
            .into_iter()
            .map(|post| PostWithComments {
                comments: comments.remove(&post.id).unwrap_or_default(),
                post,
            })
            .collect())
    }

    async fn find_posts_by_user_email(&self, email: &str) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT p.* FROM posts p JOIN users u ON u.id = p.user_id \
             WHERE u.email = $1 AND u.deleted_at IS NULL AND p.deleted_at IS NULL \
             ORDER BY p.id",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        rows_to(&rows)
    }

    async fn find_posts_with_user(&self) -> Result<Vec<PostWithAuthor>> {
        let posts = self.posts_with_live_authors("p.id", None).await?;
        let users = self
            .users_by_id(posts.iter().map(|p| p.user_id.as_i64()).collect())
            .await?;

        Ok(posts
            .into_iter()
            .filter_map(|post| {
                let author = users.get(&post.user_id)?.clone();
                Some(PostWithAuthor { post, author })
            })
            .collect())
    }

    async fn find_popular_posts(&self, min_comments: i64) -> Result<Vec<PopularPost>> {
        let rows = sqlx::query(
            "SELECT p.*, COUNT(c.id) AS comment_count FROM posts p \
             LEFT JOIN comments c ON c.post_id = p.id AND c.deleted_at IS NULL \
             WHERE p.deleted_at IS NULL \
             GROUP BY p.id HAVING COUNT(c.id) >= $1 \
             ORDER BY comment_count DESC, p.id ASC",
        )
        .bind(min_comments)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PopularPost> {
                Ok(PopularPost {
                    post: Post::from_row(row)?,
                    comment_count: row.try_get("comment_count")?,
                })
            })
            .collect()
    }

    async fn find_post_summaries(&self) -> Result<Vec<PostSummary>> {
        let rows = sqlx::query(
            "SELECT p.id, p.title, p.created_at, u.username AS user_name FROM posts p \
             JOIN users u ON u.id = p.user_id \
             WHERE p.deleted_at IS NULL AND u.deleted_at IS NULL ORDER BY p.id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PostSummary> {
                Ok(PostSummary {
                    id: PostId::new(row.try_get("id")?),
                    title: row.try_get("title")?,
                    created_at: row.try_get("created_at")?,
                    user_name: row.try_get("user_name")?,
                })
            })
            .collect()
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use common::{CommentId, PostId, UserId};

use super::{InMemoryStore, MemoryTables};
use crate::model::{Comment, NewComment, NewPost, NewTag, Post, PostTag, Tag, User};
use crate::posts::{
    CommentWithAuthor, PopularPost, PostDetails, PostRepository, PostSummary, PostWithAuthor,
    PostWithComments, dedup_by_slug,
};
use crate::users::Page;
use crate::{Result, Scope, Store, StoreError, Table};

/// In-memory post repository for testing.
///
/// Writes run in a transaction on the store it came from, so foreign keys
/// are checked the same way [`super::MemoryScope::insert`] checks them.
#[derive(Clone)]
pub struct InMemoryPostRepository {
    store: InMemoryStore,
}

impl InMemoryPostRepository {
    pub fn new(store: InMemoryStore) -> Self {
        Self { store }
    }

    /// Runs `apply` on a working copy and publishes it when `apply`
    /// succeeds.
    async fn write<T>(&self, apply: impl FnOnce(&mut MemoryTables) -> Result<T>) -> Result<T> {
        let mut scope = self.store.begin().await?;
        let value = apply(&mut scope.working)?;
        scope.commit().await?;
        Ok(value)
    }
}

fn live_post(tables: &MemoryTables, id: PostId) -> Result<&Post> {
    tables
        .posts
        .get(&id.as_i64())
        .filter(|p| p.deleted_at.is_none())
        .ok_or_else(|| StoreError::not_found(Table::Posts, id))
}

fn live_author(tables: &MemoryTables, id: UserId) -> Option<&User> {
    tables
        .users
        .get(&id.as_i64())
        .filter(|u| u.deleted_at.is_none())
}

fn live_posts(tables: &MemoryTables) -> impl Iterator<Item = &Post> {
    tables.posts.values().filter(|p| p.deleted_at.is_none())
}

fn live_comments(tables: &MemoryTables, post: PostId) -> impl Iterator<Item = &Comment> {
    tables
        .comments
        .values()
        .filter(move |c| c.post_id == post && c.deleted_at.is_none())
}

/// Links `tags` to `post`, creating tags whose slug is new.
fn attach(
    tables: &mut MemoryTables,
    post: PostId,
    tags: Vec<NewTag>,
    added_by: Option<UserId>,
) -> Result<()> {
    for new in dedup_by_slug(tags) {
        let existing = tables.tags.values().find(|t| t.slug == new.slug).map(|t| t.id);
        let tag = match existing {
            Some(id) => id,
            None => {
                if tables.tags.values().any(|t| t.name == new.name) {
                    return Err(StoreError::DuplicateTagName);
                }
                tables.insert(new).id
            }
        };
        let key = (post.as_i64(), tag.as_i64());
        if tables.post_tags.contains_key(&key) {
            continue;
        }
        if let Some(user) = added_by
            && !tables.contains(Table::Users, user.as_i64())
        {
            return Err(StoreError::not_found(Table::Users, user));
        }
        tables.post_tags.insert(
            key,
            PostTag {
                post_id: post,
                tag_id: tag,
                added_by,
                created_at: Utc::now(),
            },
        );
    }
    Ok(())
}

fn detach_all(tables: &mut MemoryTables, post: PostId) -> u64 {
    let before = tables.post_tags.len();
    tables.post_tags.retain(|(p, _), _| *p != post.as_i64());
    (before - tables.post_tags.len()) as u64
}

fn links(tables: &MemoryTables, post: PostId) -> impl Iterator<Item = &PostTag> {
    tables
        .post_tags
        .range((post.as_i64(), i64::MIN)..=(post.as_i64(), i64::MAX))
        .map(|(_, link)| link)
}

fn tags_of(tables: &MemoryTables, post: PostId) -> Vec<Tag> {
    links(tables, post)
        .filter_map(|link| tables.tags.get(&link.tag_id.as_i64()))
        .cloned()
        .collect()
}

#[async_trait]
impl PostRepository for InMemoryPostRepository {
    async fn create_post(&self, post: NewPost, tags: Vec<NewTag>) -> Result<Post> {
        self.write(|tables| {
            tables.check_references(&post)?;
            let created = tables.insert(post);
            attach(tables, created.id, tags, Some(created.user_id))?;
            Ok(created)
        })
        .await
    }

    async fn find_post(&self, id: PostId) -> Result<Post> {
        let tables = self.store.tables.lock().await;
        live_post(&tables, id).cloned()
    }

    async fn replies(&self, parent: PostId) -> Result<Vec<Post>> {
        let tables = self.store.tables.lock().await;
        Ok(live_posts(&tables)
            .filter(|p| p.parent_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn delete_post(&self, id: PostId) -> Result<()> {
        self.write(|tables| {
            live_post(tables, id)?;
            if let Some(post) = tables.posts.get_mut(&id.as_i64()) {
                post.deleted_at = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    async fn add_comment(&self, comment: NewComment) -> Result<Comment> {
        self.write(|tables| {
            live_post(tables, comment.post_id)?;
            tables.check_references(&comment)?;
            Ok(tables.insert(comment))
        })
        .await
    }

    async fn delete_comment(&self, id: CommentId) -> Result<()> {
        self.write(|tables| {
            tables
                .comments
                .get_mut(&id.as_i64())
                .filter(|c| c.deleted_at.is_none())
                .map(|c| c.deleted_at = Some(Utc::now()))
                .ok_or_else(|| StoreError::not_found(Table::Comments, id))
        })
        .await
    }

    async fn tags(&self, post: PostId) -> Result<Vec<Tag>> {
        let tables = self.store.tables.lock().await;
        live_post(&tables, post)?;
        Ok(tags_of(&tables, post))
    }

    async fn tag_links(&self, post: PostId) -> Result<Vec<PostTag>> {
        let tables = self.store.tables.lock().await;
        live_post(&tables, post)?;
        Ok(links(&tables, post).cloned().collect())
    }

    async fn append_tags(
        &self,
        post: PostId,
        tags: Vec<NewTag>,
        added_by: Option<UserId>,
    ) -> Result<()> {
        self.write(|tables| {
            live_post(tables, post)?;
            attach(tables, post, tags, added_by)
        })
        .await
    }

    async fn replace_tags(
        &self,
        post: PostId,
        tags: Vec<NewTag>,
        added_by: Option<UserId>,
    ) -> Result<()> {
        self.write(|tables| {
            live_post(tables, post)?;
            detach_all(tables, post);
            attach(tables, post, tags, added_by)
        })
        .await
    }

    async fn remove_tag(&self, post: PostId, slug: &str) -> Result<bool> {
        self.write(|tables| {
            live_post(tables, post)?;
            let Some(tag) = tables.tags.values().find(|t| t.slug == slug).map(|t| t.id) else {
                return Ok(false);
            };
            Ok(tables
                .post_tags
                .remove(&(post.as_i64(), tag.as_i64()))
                .is_some())
        })
        .await
    }

    async fn clear_tags(&self, post: PostId) -> Result<u64> {
        self.write(|tables| {
            live_post(tables, post)?;
            Ok(detach_all(tables, post))
        })
        .await
    }

    async fn count_tags(&self, post: PostId) -> Result<i64> {
        let tables = self.store.tables.lock().await;
        live_post(&tables, post)?;
        Ok(links(&tables, post).count() as i64)
    }

    async fn find_posts_with_details(&self, page: Page) -> Result<Vec<PostDetails>> {
        let tables = self.store.tables.lock().await;
        let mut posts: Vec<(&Post, &User)> = live_posts(&tables)
            .filter_map(|p| live_author(&tables, p.user_id).map(|a| (p, a)))
            .collect();
        posts.sort_by(|(a, _), (b, _)| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(posts
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .map(|(post, author)| PostDetails {
                post: post.clone(),
                author: author.clone(),
                tags: tags_of(&tables, post.id),
                comments: live_comments(&tables, post.id)
                    .filter_map(|c| {
                        live_author(&tables, c.user_id).map(|a| CommentWithAuthor {
                            comment: c.clone(),
                            author: a.clone(),
                        })
                    })
                    .collect(),
            })
            .collect())
    }

    async fn find_posts_with_active_comments(&self) -> Result<Vec<PostWithComments>> {
        let tables = self.store.tables.lock().await;
        Ok(live_posts(&tables)
            .map(|post| {
                let mut comments: Vec<Comment> =
                    live_comments(&tables, post.id).cloned().collect();
                comments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
                PostWithComments {
                    post: post.clone(),
                    comments,
                }
            })
            .collect())
    }

    async fn find_posts_by_user_email(&self, email: &str) -> Result<Vec<Post>> {
        let tables = self.store.tables.lock().await;
        Ok(live_posts(&tables)
            .filter(|p| live_author(&tables, p.user_id).is_some_and(|u| u.email == email))
            .cloned()
            .collect())
    }

    async fn find_posts_with_user(&self) -> Result<Vec<PostWithAuthor>> {
        let tables = self.store.tables.lock().await;
        Ok(live_posts(&tables)
            .filter_map(|p| {
                live_author(&tables, p.user_id).map(|a| PostWithAuthor {
                    post: p.clone(),
                    author: a.clone(),
                })
            })
            .collect())
    }

    async fn find_popular_posts(&self, min_comments: i64) -> Result<Vec<PopularPost>> {
        let tables = self.store.tables.lock().await;
        let mut counts: HashMap<PostId, i64> = HashMap::new();
        for comment in tables.comments.values().filter(|c| c.deleted_at.is_none()) {
            *counts.entry(comment.post_id).or_default() += 1;
        }

        let mut popular: Vec<PopularPost> = live_posts(&tables)
            .map(|p| PopularPost {
                post: p.clone(),
                comment_count: counts.get(&p.id).copied().unwrap_or(0),
            })
            .filter(|p| p.comment_count >= min_comments)
            .collect();
        popular.sort_by(|a, b| {
            b.comment_count
                .cmp(&a.comment_count)
                .then(a.post.id.cmp(&b.post.id))
        });
        Ok(popular)
    }

    async fn find_post_summaries(&self) -> Result<Vec<PostSummary>> {
        let tables = self.store.tables.lock().await;
        Ok(live_posts(&tables)
            .filter_map(|p| {
                live_author(&tables, p.user_id).map(|a| PostSummary {
                    id: p.id,
                    title: p.title.clone(),
                    created_at: p.created_at,
                    user_name: a.username.clone(),
                })
            })
            .collect())
    }
}

//! Optional durable backends.

#[cfg(feature = "postgres")]
pub use pg::PgDirectory;

#[cfg(feature = "postgres")]
mod pg {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use log::info;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, Row};

    use crate::error::DirectoryError;
    use crate::state::directory::{DisplayInfo, UserDirectory};

    /// User directory backed by the platform's `users` table.
    pub struct PgDirectory {
        pool: PgPool,
    }

    impl PgDirectory {
        pub async fn connect(db_url: &str) -> Result<Self, DirectoryError> {
            let pool = PgPoolOptions::new().max_connections(8).connect(db_url).await?;
            info!("Postgres user directory connected");
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl UserDirectory for PgDirectory {
        async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, DirectoryError> {
            let row = sqlx::query(
                r#"
                SELECT first_name, last_name, COALESCE(picture_path, '') AS picture_path
                FROM users
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            Ok(Some(DisplayInfo {
                first_name: row.try_get("first_name")?,
                last_name: row.try_get("last_name")?,
                picture_path: row.try_get("picture_path")?,
            }))
        }

        async fn set_online_status(
            &self,
            user_id: &str,
            is_online: bool,
            last_seen_at: DateTime<Utc>,
        ) -> Result<(), DirectoryError> {
            sqlx::query(
                r#"
                UPDATE users
                SET is_online = $2,
                    last_seen = $3
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(is_online)
            .bind(last_seen_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}

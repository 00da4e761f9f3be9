use axum::http::StatusCode;
use problemdetails::Problem;

// region:    Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Job Not Found - {0}")]
    JobNotFound(i64),

    #[error("Unknown Job Status - {0}")]
    UnknownStatus(String),

    #[error(transparent)]
    DbError(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Invalid Params - {0}")]
    InvalidParams(&'static str),

    #[error("Trigger Closed")]
    TriggerClosed,
}
// endregion: Error

impl From<Error> for Problem {
    fn from(item: Error) -> Problem {
        match item {
            Error::InvalidParams(_) | Error::Json(_) => problemdetails::new(StatusCode::BAD_REQUEST)
                .with_title(StatusCode::BAD_REQUEST.to_string())
                .with_detail(item.to_string()),
            Error::JobNotFound(_) | Error::DbError(sqlx::Error::RowNotFound) => {
                problemdetails::new(StatusCode::NOT_FOUND)
                    .with_title(StatusCode::NOT_FOUND.to_string())
                    .with_detail(item.to_string())
            }
            _ => problemdetails::new(StatusCode::INTERNAL_SERVER_ERROR)
                .with_title(StatusCode::INTERNAL_SERVER_ERROR.to_string())
                .with_detail(item.to_string())
                .with_instance(format!("{:?}", item)),
        }
    }
}

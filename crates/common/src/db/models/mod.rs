//! SeaORM entity models

mod article;
mod notification;
mod subscription;

pub use article::{
    ActiveModel as ArticleActiveModel, Column as ArticleColumn, Entity as ArticleEntity,
    Model as ArticleRow,
};

pub use subscription::{
    ActiveModel as SubscriptionActiveModel, Column as SubscriptionColumn,
    Entity as SubscriptionEntity, Model as Subscription,
};

pub use notification::{
    ActiveModel as NotificationActiveModel, Column as NotificationColumn,
    Entity as NotificationEntity, Model as NotificationRow,
};

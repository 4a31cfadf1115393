use custmaster::service::proto;
use std::collections::BTreeMap;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn parse_multi(flag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            if let Some(value) = args.next() {
                values.push(value);
            }
        }
    }
    values
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn usage() -> ! {
    eprintln!(
        "usage:\n  \
         custctl search [--server URL] [--name X] [--phone X] [--mail X] [--id X] \
         [--page-size N] [--page K] [--analyze]\n  \
         custctl update [--server URL] [--id X] [--first-name X] [--last-name X] \
         [--phone X ...] [--mail X ...]"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = std::env::args().nth(1).unwrap_or_default();
    let server = parse_arg("--server").unwrap_or_else(|| "http://127.0.0.1:50051".to_string());

    match command.as_str() {
        "search" => search(&server).await,
        "update" => update(&server).await,
        _ => usage(),
    }
}

async fn search(server: &str) -> anyhow::Result<()> {
    let mut queries = Vec::new();

    for name in parse_multi("--name") {
        queries.push(proto::CustomerQuery {
            query: Some(proto::customer_query::Query::Name(proto::NameQuery {
                last_name: name,
            })),
        });
    }
    for phone in parse_multi("--phone") {
        queries.push(proto::CustomerQuery {
            query: Some(proto::customer_query::Query::PhoneNumber(phone)),
        });
    }
    for mail in parse_multi("--mail") {
        queries.push(proto::CustomerQuery {
            query: Some(proto::customer_query::Query::EmailAddress(mail)),
        });
    }
    for id in parse_multi("--id") {
        queries.push(proto::CustomerQuery {
            query: Some(proto::customer_query::Query::Id(id)),
        });
    }

    let pagination = parse_arg("--page-size").map(|size| proto::Pagination {
        page_size: size.parse().unwrap_or(0),
        page: parse_arg("--page").and_then(|p| p.parse().ok()).unwrap_or(0),
        sort_by: Vec::new(),
    });

    let mut client =
        proto::customer_service_client::CustomerServiceClient::connect(server.to_string()).await?;
    let response = client
        .search_customer(proto::SearchCustomerRequest {
            queries,
            pagination,
        })
        .await?
        .into_inner();

    if has_flag("--analyze") {
        analyze(&response);
        return Ok(());
    }

    for result in &response.results {
        let Some(customer) = &result.customer else {
            continue;
        };
        println!(
            "{}  {} {}  phones=[{}]  mails=[{}]",
            customer.id,
            customer.last_name,
            customer.first_name,
            customer.phone_numbers.join(", "),
            customer.email_addresses.join(", "),
        );
    }
    println!("{} of {} total", response.results.len(), response.total_results);

    Ok(())
}

/// Print customer counts grouped by postal code.
fn analyze(response: &proto::SearchCustomerResponse) {
    let mut by_postal_code: BTreeMap<String, usize> = BTreeMap::new();

    for result in &response.results {
        let Some(customer) = &result.customer else {
            continue;
        };
        if customer.addresses.is_empty() {
            *by_postal_code.entry("<none>".to_string()).or_default() += 1;
        }
        for address in &customer.addresses {
            let key = if address.postal_code.is_empty() {
                "<none>".to_string()
            } else {
                address.postal_code.clone()
            };
            *by_postal_code.entry(key).or_default() += 1;
        }
    }

    for (postal_code, count) in by_postal_code {
        println!("{postal_code}: {count}");
    }
    println!("total: {}", response.total_results);
}

async fn update(server: &str) -> anyhow::Result<()> {
    let customer = proto::Customer {
        id: parse_arg("--id").unwrap_or_default(),
        first_name: parse_arg("--first-name").unwrap_or_default(),
        last_name: parse_arg("--last-name").unwrap_or_default(),
        phone_numbers: parse_multi("--phone"),
        email_addresses: parse_multi("--mail"),
        addresses: Vec::new(),
    };

    let mut client =
        proto::customer_service_client::CustomerServiceClient::connect(server.to_string()).await?;
    let response = client
        .update_customer(proto::UpdateCustomerRequest {
            customer: Some(customer),
            updates: Vec::new(),
        })
        .await?
        .into_inner();

    match response.response.and_then(|r| r.customer) {
        Some(customer) => println!("updated customer {}", customer.id),
        None => println!("update returned no customer"),
    }

    Ok(())
}
